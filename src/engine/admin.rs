//! Operator controls: publishing firmware and forcing updates.

use std::sync::Arc;
use tracing::info;

use crate::engine::error::{FleetError, Result};
use crate::engine::firmware::{FirmwareImage, FirmwareStore};
use crate::engine::registry::{DeviceRecord, DeviceRegistry};

#[derive(Clone)]
pub struct UpdateAdmin {
    store: Arc<FirmwareStore>,
    registry: DeviceRegistry,
}

impl UpdateAdmin {
    pub fn new(store: Arc<FirmwareStore>, registry: DeviceRegistry) -> Self {
        Self { store, registry }
    }

    pub async fn publish_firmware(
        &self,
        payload: Vec<u8>,
        explicit_version: Option<&str>,
    ) -> Result<FirmwareImage> {
        if payload.is_empty() {
            return Err(FleetError::Validation("No firmware file provided".to_string()));
        }
        Ok(self.store.publish(payload, explicit_version).await?)
    }

    pub async fn force_update(&self, device_id: Option<&str>) -> Result<DeviceRecord> {
        self.set_forced(device_id, true).await
    }

    /// Explicit counterpart of `force_update`; the flag is never cleared automatically
    pub async fn clear_forced_update(&self, device_id: Option<&str>) -> Result<DeviceRecord> {
        self.set_forced(device_id, false).await
    }

    async fn set_forced(&self, device_id: Option<&str>, value: bool) -> Result<DeviceRecord> {
        let device_id = require_device_id(device_id)?;
        let registry = self.registry.clone();
        let id = device_id.clone();
        let record = tokio::task::spawn_blocking(move || registry.set_forced(&id, value)).await??;
        info!(device_id = %device_id, forced = value, "Forced-update flag changed");
        Ok(record)
    }
}

fn require_device_id(device_id: Option<&str>) -> Result<String> {
    device_id
        .filter(|id| !id.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| FleetError::Validation("No device ID provided".to_string()))
}
