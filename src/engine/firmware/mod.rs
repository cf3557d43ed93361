//! FleetOTA Firmware Store
//!
//! Holds the one firmware image currently published to the fleet.
//!
//! Components:
//! - `store` - Single-slot storage with atomic replace
//! - `stream` - Chunked transfer of an opened image
//! - `verify` - Content hashing

pub mod store;
pub mod stream;
pub mod verify;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use store::FirmwareStore;
pub use stream::FirmwareDownload;

/// Metadata of the published firmware image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct FirmwareImage {
    pub version: String,
    /// Hex SHA256 of the binary
    pub content_hash: String,
    pub size: u64,
    #[schema(value_type = String)]
    pub published_at: DateTime<Utc>,
}

impl FirmwareImage {
    pub(crate) fn blob_name(&self) -> String {
        format!("{}.bin", self.content_hash)
    }
}
