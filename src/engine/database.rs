//! FleetOTA Database Module
//! SQLite adapter with connection pooling and bounded storage timeouts

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Failed to obtain database connection: {0}")]
    PoolError(#[from] r2d2::Error),
    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),
    #[error("Failed to prepare database location: {0}")]
    Io(#[from] std::io::Error),
}

/// Process-wide storage client. Constructed once at startup and handed to
/// the registry by reference; dropping the last clone closes the pool.
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    pub fn new(db_path: &Path, timeout: Duration, pool_size: u32) -> Result<Self, DatabaseError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let manager = SqliteConnectionManager::file(db_path)
            .with_init(move |conn| conn.busy_timeout(timeout));
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .connection_timeout(timeout)
            .build(manager)?;

        let db = Self { pool };
        db.init_schema(true)?;
        Ok(db)
    }

    pub fn in_memory() -> Result<Self, DatabaseError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .connection_timeout(Duration::from_secs(5))
            .build(manager)?;
        let db = Self { pool };
        db.init_schema(false)?;
        Ok(db)
    }

    fn init_schema(&self, wal: bool) -> Result<(), DatabaseError> {
        let conn = self.pool.get()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS devices (
                device_id TEXT PRIMARY KEY NOT NULL,
                ip_address TEXT,
                last_seen INTEGER,
                reported_firmware_version TEXT,
                last_update_check INTEGER,
                current_version_at_check TEXT,
                update_forced INTEGER NOT NULL DEFAULT 0,
                first_seen INTEGER NOT NULL
            )",
            [],
        )?;

        if wal {
            // PRAGMA journal_mode returns the resulting mode as a row
            let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        }

        Ok(())
    }

    pub fn get_connection(&self) -> Result<DbConnection, DatabaseError> {
        Ok(self.pool.get()?)
    }

    /// Reachability probe. Read-only.
    pub fn ping(&self) -> Result<(), DatabaseError> {
        let conn = self.get_connection()?;
        let _: i64 = conn.query_row("SELECT 1", [], |row| row.get(0))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_database_creates_parent_and_schema() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("fleet.db");
        let db = Database::new(&path, Duration::from_millis(500), 4).unwrap();

        assert!(path.exists());
        db.ping().unwrap();

        let conn = db.get_connection().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM devices", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_reopen_keeps_schema() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fleet.db");
        {
            let db = Database::new(&path, Duration::from_millis(500), 2).unwrap();
            db.get_connection()
                .unwrap()
                .execute(
                    "INSERT INTO devices (device_id, first_seen) VALUES ('d1', 0)",
                    [],
                )
                .unwrap();
        }

        let db = Database::new(&path, Duration::from_millis(500), 2).unwrap();
        let count: i64 = db
            .get_connection()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM devices", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_in_memory_ping() {
        let db = Database::in_memory().unwrap();
        db.ping().unwrap();
    }
}
