//! FleetOTA Error Types

use std::io;
use std::time::Duration;
use thiserror::Error;

use super::database::DatabaseError;

/// Failures of the persistence layer (SQLite registry or firmware files)
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Firmware metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("Storage operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Firmware image is corrupt: {0}")]
    Corrupt(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(DatabaseError::SqliteError(e))
    }
}

impl From<r2d2::Error> for StorageError {
    fn from(e: r2d2::Error) -> Self {
        Self::Database(DatabaseError::PoolError(e))
    }
}

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("{0}")]
    Validation(String),

    #[error("No firmware available")]
    NotPublished,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<tokio::task::JoinError> for FleetError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Internal(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;
