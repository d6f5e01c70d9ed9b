//! Connection bootstrap.
//!
//! # Invariants
//! - Returned connections enforce foreign keys and wait up to
//!   `BUSY_TIMEOUT` for the write lock.
//! - File databases run in WAL mode so readers do not block the scheduler.
//! - Returned connections are fully migrated.

use super::migrations::apply_migrations;
use super::DbResult;
use log::{error, info};
use rusqlite::Connection;
use std::path::Path;
use std::time::{Duration, Instant};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Storage {
    File,
    Memory,
}

impl Storage {
    fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Memory => "memory",
        }
    }
}

/// Opens (creating if needed) a database file and migrates it.
pub fn open_db(path: impl AsRef<Path>) -> DbResult<Connection> {
    open_logged(Storage::File, || Ok(Connection::open(path)?))
}

/// Opens a private in-memory database and migrates it.
pub fn open_db_in_memory() -> DbResult<Connection> {
    open_logged(Storage::Memory, || Ok(Connection::open_in_memory()?))
}

fn open_logged(
    storage: Storage,
    opener: impl FnOnce() -> DbResult<Connection>,
) -> DbResult<Connection> {
    let started_at = Instant::now();
    let result = opener().and_then(|mut conn| {
        configure(&conn, storage)?;
        apply_migrations(&mut conn)?;
        Ok(conn)
    });
    let elapsed_ms = started_at.elapsed().as_millis();
    match &result {
        Ok(_) => info!(
            "event=db_open module=db status=ok storage={} duration_ms={elapsed_ms}",
            storage.as_str()
        ),
        Err(err) => error!(
            "event=db_open module=db status=error storage={} duration_ms={elapsed_ms} error={err}",
            storage.as_str()
        ),
    }
    result
}

fn configure(conn: &Connection, storage: Storage) -> DbResult<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update(None, "foreign_keys", true)?;
    if storage == Storage::File {
        // journal_mode returns the resulting mode as a row.
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
    }
    Ok(())
}
