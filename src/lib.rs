//! FleetOTA - Firmware distribution and device fleet tracking
//!
//! Devices poll for firmware and report sightings; operators publish one
//! firmware image for the whole fleet and can force individual devices to
//! reinstall it.

pub mod engine;

use engine::admin::UpdateAdmin;
use engine::config::Config;
use engine::database::Database;
use engine::error::StorageError;
use engine::firmware::FirmwareStore;
use engine::registry::DeviceRegistry;
use engine::updates::UpdateEngine;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Everything a running service needs, built once at startup.
///
/// The storage client (SQLite pool) lives here rather than in global state;
/// the registry and store borrow it through this context and it is closed
/// when the context is dropped.
pub struct FleetContext {
    pub config: Config,
    pub database: Database,
    pub store: Arc<FirmwareStore>,
    pub registry: DeviceRegistry,
    pub updates: UpdateEngine,
    pub admin: UpdateAdmin,
}

impl FleetContext {
    pub fn open(data_dir: &Path, config: Config) -> Result<Self, StorageError> {
        let timeout = config.storage.timeout();
        let db_path = config.database_path(data_dir);
        let database = Database::new(&db_path, timeout, config.storage.pool_size)?;
        let store = Arc::new(FirmwareStore::open(&config.firmware_dir(data_dir), timeout)?);
        info!(
            database = %db_path.display(),
            firmware = %store.root().display(),
            "Storage opened"
        );
        Ok(Self::assemble(config, database, store))
    }

    /// Context over an in-memory registry, used by tests
    pub fn in_memory(firmware_dir: &Path, config: Config) -> Result<Self, StorageError> {
        let database = Database::in_memory()?;
        let store = Arc::new(FirmwareStore::open(firmware_dir, config.storage.timeout())?);
        Ok(Self::assemble(config, database, store))
    }

    fn assemble(config: Config, database: Database, store: Arc<FirmwareStore>) -> Self {
        let registry = DeviceRegistry::new(database.clone());
        Self {
            updates: UpdateEngine::new(store.clone(), registry.clone()),
            admin: UpdateAdmin::new(store.clone(), registry.clone()),
            config,
            database,
            store,
            registry,
        }
    }

    pub fn close(self) {
        drop(self);
        info!("Storage closed");
    }
}
