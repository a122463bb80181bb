use crate::error::{Error, Result};
use chrono::{SecondsFormat, Utc};
use rusqlite::Connection;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info};

pub(crate) const SCHEMA_VERSION: i64 = 2;

/// Durable per-file status table backed by SQLite.
///
/// The connection sits behind a mutex so status queries from auxiliary tools
/// in the same process never interleave with a half-applied update.
pub struct Database {
    conn: Mutex<Connection>,
    require_hash_on_complete: bool,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
                info!("Created database directory {}", parent.display());
            }
        }
        let conn = Connection::open(path)?;
        let db = Self::from_connection(conn)?;
        info!("Status store opened at {}", path.display());
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Database {
            conn: Mutex::new(conn),
            require_hash_on_complete: false,
        };
        db.configure_pragmas()?;
        db.migrate_schema()?;
        Ok(db)
    }

    /// Refuse `completed` on rows with an empty content hash.
    /// Enabled whenever checksum verification is on.
    pub fn with_hash_required(mut self, required: bool) -> Self {
        self.require_hash_on_complete = required;
        self
    }

    pub(crate) fn hash_required(&self) -> bool {
        self.require_hash_on_complete
    }

    fn configure_pragmas(&self) -> Result<()> {
        self.lock_conn().execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 30000;",
        )?;
        debug!("SQLite pragmas configured (WAL mode, 30s busy timeout)");
        Ok(())
    }

    fn migrate_schema(&self) -> Result<()> {
        let conn = self.lock_conn();
        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version > SCHEMA_VERSION {
            return Err(Error::Other(format!(
                "status store schema version {} is newer than supported version {}",
                version, SCHEMA_VERSION
            )));
        }
        if version < 2 {
            // Version 1 stamped out-of-band edits with millisecond precision
            conn.execute_batch("DROP TRIGGER IF EXISTS media_transfer_status_touch;")?;
        }
        conn.execute_batch(include_str!("schema.sql"))?;
        debug!("SQLite schema initialized (version {})", SCHEMA_VERSION);
        Ok(())
    }

    /// A poisoned mutex still guards a usable connection: every mutation is a
    /// single statement or transaction, so SQLite never holds a torn row.
    pub(crate) fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run a closure against the raw connection. Used by tooling and tests.
    pub fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        Ok(f(&self.lock_conn())?)
    }

    /// Convert a storage failure into the crate error, logging it first.
    pub(crate) fn logged<T>(&self, op: &str, result: rusqlite::Result<T>) -> Result<T> {
        result.map_err(|e| {
            error!("Status store {} failed: {}", op, e);
            Error::Database(e)
        })
    }
}

/// RFC 3339 UTC with fixed microsecond precision, so text order is time order.
pub(crate) fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}
