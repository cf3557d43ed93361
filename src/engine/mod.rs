// FleetOTA Engine - Core module structure
pub mod config;
pub mod database;
pub mod error;
pub mod firmware;
pub mod registry;
pub mod updates;
pub mod admin;
pub mod api;
pub mod cli;
pub mod logging;

pub use admin::UpdateAdmin;
pub use config::Config;
pub use database::Database;
pub use error::{FleetError, StorageError};
pub use firmware::{FirmwareImage, FirmwareStore};
pub use registry::{DeviceRecord, DeviceRegistry, DeviceUpdate};
pub use updates::{PollOutcome, PollRequest, UpdateEngine};
