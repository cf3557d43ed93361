//! FleetOTA CLI Module
//! Command-line interface for serving and operating the firmware service

pub mod formatter;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::engine::logging::Verbosity;

#[derive(Parser, Debug)]
#[command(name = "fleetota")]
#[command(author = "FleetOTA Team")]
#[command(version)]
#[command(about = "Firmware distribution and device fleet tracking", long_about = None)]
pub struct Cli {
    /// Data directory holding the config, database and firmware
    #[arg(short, long, global = true)]
    pub dir: Option<PathBuf>,

    /// Output format (json for scripting)
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Only log errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a default config and create the storage layout
    Init,

    /// Start the HTTP API server
    Serve {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
    },

    /// Publish a firmware binary to the fleet
    Publish {
        /// Path to the firmware binary
        file: PathBuf,

        /// Version label (defaults to the publish timestamp)
        #[arg(long)]
        fw_version: Option<String>,
    },

    /// Show the published firmware and verify its integrity
    Status,

    /// Device registry commands
    Devices {
        #[command(subcommand)]
        action: DevicesAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum DevicesAction {
    /// List all known devices
    List,

    /// Show a single device
    Show {
        device_id: String,
    },

    /// Force a device to download the firmware on its next poll
    Force {
        device_id: String,
    },

    /// Clear a forced update
    Clear {
        device_id: String,
    },
}

impl Cli {
    pub fn data_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(default_data_dir)
    }

    pub fn verbosity(&self) -> Verbosity {
        Verbosity::from_flags(self.quiet, self.verbose)
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("fleetota"))
        .unwrap_or_else(|| PathBuf::from("."))
}
