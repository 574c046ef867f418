//! SQLite connector helpers for the Lingua storage layer.

use crate::Pool;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

// Ingestion holds a write transaction for the whole bulk import.
const BUSY_TIMEOUT_MS: u64 = 5_000;

pub struct SqliteConn {
    conn: Connection,
}

impl SqliteConn {
    /// Opens `path` read-write, creating it if needed, in WAL mode.
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
        let conn = Connection::open_with_flags(path, flags)?;
        conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
        conn.pragma_update(None, "foreign_keys", 1)?;
        let journal: String =
            conn.pragma_update_and_check(None, "journal_mode", "wal", |row| row.get(0))?;
        tracing::debug!(path = %path.display(), journal = %journal, "opened sqlite connection");
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

/// Builds a pool whose connections are opened lazily against `path`.
pub fn sqlite_pool(path: &Path, pool_size: usize) -> Arc<Pool<SqliteConn>> {
    let path = path.to_path_buf();
    Pool::new(pool_size, move || SqliteConn::open(&path))
}
