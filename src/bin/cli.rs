//! FleetOTA CLI - Main entry point
//!
//! Serves the firmware API and offers the operator actions locally.

use anyhow::{bail, Context};
use clap::Parser;
use fleetota_lib::engine::{
    api::{self, ApiState},
    cli::formatter::{format_size, short_hash, CliFormatter},
    cli::{Cli, Commands, DevicesAction, OutputFormat},
    config::Config,
    logging::init_logging,
    registry::DeviceView,
};
use fleetota_lib::FleetContext;
use std::path::Path;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbosity());

    if let Err(e) = run_cli(cli).await {
        CliFormatter::error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run_cli(cli: Cli) -> anyhow::Result<()> {
    let data_dir = cli.data_dir();
    let json = cli.format == OutputFormat::Json;

    match cli.command {
        Commands::Init => cmd_init(&data_dir, json),
        Commands::Serve { port, host } => cmd_serve(&data_dir, host, port).await,
        Commands::Publish { file, fw_version } => {
            cmd_publish(&data_dir, &file, fw_version.as_deref(), json).await
        }
        Commands::Status => cmd_status(&data_dir, json).await,
        Commands::Devices { action } => cmd_devices(&data_dir, action, json).await,
    }
}

fn open_context(data_dir: &Path) -> anyhow::Result<FleetContext> {
    let config = Config::load_or_default(data_dir)
        .with_context(|| format!("loading config from {}", data_dir.display()))?;
    FleetContext::open(data_dir, config).context("opening storage")
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cmd_init(data_dir: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load_or_default(data_dir)?;
    config.save(data_dir)?;
    let fleet = FleetContext::open(data_dir, config)?;

    if json {
        print_json(&serde_json::json!({
            "data_dir": data_dir,
            "database": fleet.config.database_path(data_dir),
            "firmware_dir": fleet.store.root(),
        }))?;
    } else {
        CliFormatter::success(&format!("Initialized FleetOTA in {}", data_dir.display()));
        CliFormatter::kv("Database", &fleet.config.database_path(data_dir).display().to_string());
        CliFormatter::kv("Firmware", &fleet.store.root().display().to_string());
    }
    fleet.close();
    Ok(())
}

async fn cmd_serve(data_dir: &Path, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let mut config = Config::load_or_default(data_dir)?;
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    let addr = config.server.bind_addr();

    let fleet = Arc::new(FleetContext::open(data_dir, config)?);
    CliFormatter::header("FleetOTA API Server");
    CliFormatter::kv("Data", &data_dir.display().to_string());
    CliFormatter::kv("Listening", &format!("http://{}", addr));
    match fleet.store.current()? {
        Some(image) => CliFormatter::kv("Firmware", &image.version),
        None => CliFormatter::warning("No firmware published yet"),
    }

    api::serve(ApiState { fleet: fleet.clone() }, &addr).await?;

    // All request handlers are gone once serve returns
    if let Ok(fleet) = Arc::try_unwrap(fleet) {
        fleet.close();
    }
    Ok(())
}

async fn cmd_publish(
    data_dir: &Path,
    file: &Path,
    version: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let payload = tokio::fs::read(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    let fleet = open_context(data_dir)?;
    let image = fleet.admin.publish_firmware(payload, version).await?;

    if json {
        print_json(&image)?;
    } else {
        CliFormatter::success("Firmware uploaded successfully");
        CliFormatter::kv("Version", &image.version);
        CliFormatter::kv("SHA256", &image.content_hash);
        CliFormatter::kv("Size", &format_size(image.size));
    }
    fleet.close();
    Ok(())
}

async fn cmd_status(data_dir: &Path, json: bool) -> anyhow::Result<()> {
    let fleet = open_context(data_dir)?;
    let verified = fleet.store.verify_current().await?;

    match (verified, json) {
        (None, true) => print_json(&serde_json::json!({ "published": false }))?,
        (None, false) => CliFormatter::info("No firmware published yet"),
        (Some(image), true) => print_json(&serde_json::json!({
            "published": true,
            "verified": true,
            "firmware": image,
        }))?,
        (Some(image), false) => {
            CliFormatter::header("Published Firmware");
            CliFormatter::kv("Version", &image.version);
            CliFormatter::kv("SHA256", &image.content_hash);
            CliFormatter::kv("Size", &format_size(image.size));
            CliFormatter::kv(
                "Published",
                &image
                    .published_at
                    .with_timezone(&chrono::Local)
                    .format(&fleet.config.display.timestamp_format)
                    .to_string(),
            );
            CliFormatter::success("Integrity verified");
        }
    }
    fleet.close();
    Ok(())
}

async fn cmd_devices(data_dir: &Path, action: DevicesAction, json: bool) -> anyhow::Result<()> {
    let fleet = open_context(data_dir)?;
    let format = fleet.config.display.timestamp_format.clone();

    match action {
        DevicesAction::List => {
            let views: Vec<DeviceView> = fleet
                .registry
                .list()?
                .iter()
                .map(|r| DeviceView::new(r, &format))
                .collect();
            if json {
                print_json(&serde_json::json!({ "devices": views }))?;
            } else if views.is_empty() {
                CliFormatter::info("No devices have been seen yet");
            } else {
                let published = fleet.store.current()?.map(|i| i.version);
                CliFormatter::table_header(&["Device", "IP", "Last seen", "Version", "Last check", "Forced"]);
                for view in &views {
                    let version = view.current_version.as_deref().or(view.firmware_version.as_deref());
                    let marker = match (version, published.as_deref()) {
                        (Some(v), Some(p)) if v == p => format!("{} (current)", v),
                        (Some(v), _) => v.to_string(),
                        (None, _) => "-".to_string(),
                    };
                    CliFormatter::table_row(&[
                        view.device_id.as_str(),
                        view.ip_address.as_deref().unwrap_or("-"),
                        view.last_seen.as_deref().unwrap_or("-"),
                        marker.as_str(),
                        view.last_update_check.as_deref().unwrap_or("-"),
                        if view.update_forced { "yes" } else { "no" },
                    ]);
                }
                if let Some(image) = fleet.store.current()? {
                    CliFormatter::kv("Published", &format!("{} ({})", image.version, short_hash(&image.content_hash)));
                }
            }
        }
        DevicesAction::Show { device_id } => {
            let Some(record) = fleet.registry.get(&device_id)? else {
                bail!("Device not found: {}", device_id);
            };
            let view = DeviceView::new(&record, &format);
            if json {
                print_json(&view)?;
            } else {
                CliFormatter::header(&view.device_id);
                CliFormatter::kv("IP address", view.ip_address.as_deref().unwrap_or("-"));
                CliFormatter::kv("Last seen", view.last_seen.as_deref().unwrap_or("-"));
                CliFormatter::kv("Reported version", view.firmware_version.as_deref().unwrap_or("-"));
                CliFormatter::kv("Last update check", view.last_update_check.as_deref().unwrap_or("-"));
                CliFormatter::kv("Version at check", view.current_version.as_deref().unwrap_or("-"));
                CliFormatter::kv("Update forced", if view.update_forced { "yes" } else { "no" });
            }
        }
        DevicesAction::Force { device_id } => {
            let record = fleet.admin.force_update(Some(&device_id)).await?;
            if json {
                print_json(&DeviceView::new(&record, &format))?;
            } else {
                CliFormatter::success(&format!("Update forced for device {}", record.device_id));
            }
        }
        DevicesAction::Clear { device_id } => {
            let record = fleet.admin.clear_forced_update(Some(&device_id)).await?;
            if json {
                print_json(&DeviceView::new(&record, &format))?;
            } else {
                CliFormatter::success(&format!("Forced update cleared for device {}", record.device_id));
            }
        }
    }
    fleet.close();
    Ok(())
}
