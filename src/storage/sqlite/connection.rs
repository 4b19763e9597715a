//! Shared connection handling for the `SQLite` backends.

use crate::{Error, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Busy timeout applied to every connection, in milliseconds.
///
/// Several worker processes share one database file; rebuild lock attempts
/// and hash writes wait this long for each other instead of failing with
/// `SQLITE_BUSY`.
pub const BUSY_TIMEOUT_MS: u32 = 5000;

/// Acquires a mutex, recovering the guard if a previous holder panicked.
pub fn acquire_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("SQLite mutex was poisoned, recovering");
        metrics::counter!("repostscan_sqlite_mutex_poison_total").increment(1);
        poisoned.into_inner()
    })
}

/// Applies WAL journaling, NORMAL sync and the busy timeout.
///
/// Pragma results are ignored: in-memory databases cannot switch to WAL and
/// report `memory` instead, which is fine for tests.
pub fn configure_connection(conn: &Connection) {
    let _ = conn.pragma_update(None, "journal_mode", "WAL");
    let _ = conn.pragma_update(None, "synchronous", "NORMAL");
    let _ = conn.pragma_update(None, "busy_timeout", BUSY_TIMEOUT_MS);
}

/// Opens (creating if needed) and configures a database file.
///
/// # Errors
///
/// Returns [`Error::DataSourceUnavailable`] if the file cannot be opened.
pub fn open_connection(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| Error::data_source("create_db_dir", e))?;
    }
    let conn = Connection::open(path).map_err(|e| Error::data_source("open_sqlite", e))?;
    configure_connection(&conn);
    Ok(conn)
}

/// Opens a private in-memory database.
///
/// # Errors
///
/// Returns [`Error::DataSourceUnavailable`] if `SQLite` cannot allocate it.
pub fn open_in_memory() -> Result<Connection> {
    let conn =
        Connection::open_in_memory().map_err(|e| Error::data_source("open_sqlite_memory", e))?;
    configure_connection(&conn);
    Ok(conn)
}

/// Converts a row id to the signed integer `SQLite` stores.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if the id does not fit.
pub fn to_sql_id(row_id: u64) -> Result<i64> {
    i64::try_from(row_id).map_err(|_| Error::InvalidInput(format!("row id {row_id} out of range")))
}
