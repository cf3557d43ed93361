//! FleetOTA Device Registry
//! Durable record of every device that reported telemetry or polled for firmware

use chrono::{DateTime, Local, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use tracing::debug;

use crate::engine::database::Database;
use crate::engine::error::StorageError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceRecord {
    pub device_id: String,
    pub ip_address: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
    pub reported_firmware_version: Option<String>,
    pub last_update_check: Option<DateTime<Utc>>,
    pub current_version_at_check: Option<String>,
    pub update_forced: bool,
    pub first_seen: DateTime<Utc>,
}

/// Field-level patch for a device. `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceUpdate {
    pub ip_address: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
    pub reported_firmware_version: Option<String>,
    pub last_update_check: Option<DateTime<Utc>>,
    pub current_version_at_check: Option<String>,
    pub update_forced: Option<bool>,
}

impl DeviceUpdate {
    /// Sighting reported by the telemetry path
    pub fn telemetry(
        firmware_version: Option<&str>,
        ip_address: Option<&str>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            ip_address: ip_address.map(str::to_string),
            last_seen: Some(at),
            reported_firmware_version: firmware_version.map(str::to_string),
            ..Self::default()
        }
    }

    /// Firmware poll
    pub fn update_check(reported_version: Option<&str>, at: DateTime<Utc>) -> Self {
        Self {
            last_update_check: Some(at),
            current_version_at_check: reported_version.map(str::to_string),
            ..Self::default()
        }
    }

    pub fn forced(value: bool) -> Self {
        Self {
            update_forced: Some(value),
            ..Self::default()
        }
    }
}

/// Device listing with timestamps rendered in local time
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct DeviceView {
    pub device_id: String,
    pub ip_address: Option<String>,
    pub last_seen: Option<String>,
    pub firmware_version: Option<String>,
    pub last_update_check: Option<String>,
    pub current_version: Option<String>,
    pub update_forced: bool,
    pub first_seen: String,
}

impl DeviceView {
    pub fn new(record: &DeviceRecord, timestamp_format: &str) -> Self {
        let render = |ts: &DateTime<Utc>| ts.with_timezone(&Local).format(timestamp_format).to_string();
        Self {
            device_id: record.device_id.clone(),
            ip_address: record.ip_address.clone(),
            last_seen: record.last_seen.as_ref().map(render),
            firmware_version: record.reported_firmware_version.clone(),
            last_update_check: record.last_update_check.as_ref().map(render),
            current_version: record.current_version_at_check.clone(),
            update_forced: record.update_forced,
            first_seen: render(&record.first_seen),
        }
    }
}

const COLUMNS: &str = "device_id, ip_address, last_seen, reported_firmware_version, \
     last_update_check, current_version_at_check, update_forced, first_seen";

// One statement: the merge is atomic per call. Timestamps only move forward.
const UPSERT_SQL: &str = "INSERT INTO devices (device_id, ip_address, last_seen, reported_firmware_version,
                         last_update_check, current_version_at_check, update_forced, first_seen)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, COALESCE(?7, 0), ?8)
     ON CONFLICT(device_id) DO UPDATE SET
         ip_address = COALESCE(?2, ip_address),
         last_seen = MAX(COALESCE(?3, last_seen), COALESCE(last_seen, ?3)),
         reported_firmware_version = COALESCE(?4, reported_firmware_version),
         last_update_check = MAX(COALESCE(?5, last_update_check), COALESCE(last_update_check, ?5)),
         current_version_at_check = COALESCE(?6, current_version_at_check),
         update_forced = COALESCE(?7, update_forced)
     RETURNING device_id, ip_address, last_seen, reported_firmware_version,
         last_update_check, current_version_at_check, update_forced, first_seen";

#[derive(Clone)]
pub struct DeviceRegistry {
    db: Database,
}

impl DeviceRegistry {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Merge `update` into the device's record, creating it if absent
    pub fn upsert(&self, device_id: &str, update: &DeviceUpdate) -> Result<DeviceRecord, StorageError> {
        let conn = self.db.get_connection()?;
        let record = conn.query_row(
            UPSERT_SQL,
            params![
                device_id,
                update.ip_address,
                update.last_seen.map(|t| t.timestamp_millis()),
                update.reported_firmware_version,
                update.last_update_check.map(|t| t.timestamp_millis()),
                update.current_version_at_check,
                update.update_forced,
                Utc::now().timestamp_millis(),
            ],
            map_row,
        )?;
        debug!(device_id, ?update, "Device record merged");
        Ok(record)
    }

    pub fn get(&self, device_id: &str) -> Result<Option<DeviceRecord>, StorageError> {
        let conn = self.db.get_connection()?;
        let record = conn
            .query_row(
                &format!("SELECT {} FROM devices WHERE device_id = ?1", COLUMNS),
                [device_id],
                map_row,
            )
            .optional()?;
        Ok(record)
    }

    /// All devices in first-contact order
    pub fn list(&self) -> Result<Vec<DeviceRecord>, StorageError> {
        let conn = self.db.get_connection()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM devices ORDER BY rowid", COLUMNS))?;
        let devices = stmt
            .query_map([], map_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(devices)
    }

    pub fn set_forced(&self, device_id: &str, value: bool) -> Result<DeviceRecord, StorageError> {
        self.upsert(device_id, &DeviceUpdate::forced(value))
    }

    pub fn record_telemetry(
        &self,
        device_id: &str,
        firmware_version: Option<&str>,
        ip_address: Option<&str>,
    ) -> Result<DeviceRecord, StorageError> {
        self.upsert(
            device_id,
            &DeviceUpdate::telemetry(firmware_version, ip_address, Utc::now()),
        )
    }

    pub fn record_update_check(
        &self,
        device_id: &str,
        reported_version: Option<&str>,
    ) -> Result<DeviceRecord, StorageError> {
        self.upsert(device_id, &DeviceUpdate::update_check(reported_version, Utc::now()))
    }

    pub fn ping(&self) -> Result<(), StorageError> {
        Ok(self.db.ping()?)
    }
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<DeviceRecord> {
    Ok(DeviceRecord {
        device_id: row.get(0)?,
        ip_address: row.get(1)?,
        last_seen: opt_timestamp(row, 2)?,
        reported_firmware_version: row.get(3)?,
        last_update_check: opt_timestamp(row, 4)?,
        current_version_at_check: row.get(5)?,
        update_forced: row.get(6)?,
        first_seen: timestamp(row, 7)?,
    })
}

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let millis: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(millis)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, millis))
}

fn opt_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let millis: Option<i64> = row.get(idx)?;
    millis
        .map(|m| DateTime::from_timestamp_millis(m).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, m)))
        .transpose()
}
