//! `SQLite` rebuild lock.
//!
//! Workers on one host (or sharing one database file over a filesystem with
//! working locks) coordinate through a `rebuild_locks` table. Each attempt
//! runs in an `IMMEDIATE` transaction so the expiry sweep and the insert are
//! atomic with respect to other processes.

use super::connection::{acquire_lock, open_connection, open_in_memory};
use crate::storage::traits::{LockService, LockToken, now_ms};
use crate::{Error, Result};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// `SQLite`-backed [`LockService`].
pub struct SqliteLockService {
    conn: Mutex<Connection>,
}

impl SqliteLockService {
    /// Opens the lock table in the database at `db_path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn new(db_path: impl Into<PathBuf>) -> Result<Self> {
        let service = Self {
            conn: Mutex::new(open_connection(&db_path.into())?),
        };
        service.initialize()?;
        Ok(service)
    }

    /// Creates an in-memory lock service (useful for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self> {
        let service = Self {
            conn: Mutex::new(open_in_memory()?),
        };
        service.initialize()?;
        Ok(service)
    }

    fn initialize(&self) -> Result<()> {
        let conn = acquire_lock(&self.conn);
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS rebuild_locks (
                name TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                token TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );",
        )
        .map_err(|e| Error::operation("init_lock_table", e))
    }
}

impl LockService for SqliteLockService {
    fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> Result<Option<LockToken>> {
        let token = LockToken::new(name, holder, ttl);
        let mut conn = acquire_lock(&self.conn);
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| Error::operation("lock_begin", e))?;

        tx.execute(
            "DELETE FROM rebuild_locks WHERE name = ?1 AND expires_at <= ?2",
            params![name, now_ms()],
        )
        .map_err(|e| Error::operation("lock_expire", e))?;
        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO rebuild_locks (name, holder, token, expires_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![name, holder, token.token, token.expires_at_ms],
            )
            .map_err(|e| Error::operation("lock_insert", e))?;
        tx.commit().map_err(|e| Error::operation("lock_commit", e))?;

        if inserted == 0 {
            debug!(lock = name, "rebuild lock held elsewhere");
            return Ok(None);
        }
        debug!(lock = name, holder, "rebuild lock acquired");
        Ok(Some(token))
    }

    fn release(&self, token: &LockToken) -> Result<bool> {
        let conn = acquire_lock(&self.conn);
        let removed = conn
            .execute(
                "DELETE FROM rebuild_locks WHERE name = ?1 AND token = ?2",
                params![token.name, token.token],
            )
            .map_err(|e| Error::operation("lock_release", e))?;
        Ok(removed > 0)
    }

    fn holder(&self, name: &str) -> Result<Option<String>> {
        let conn = acquire_lock(&self.conn);
        conn.query_row(
            "SELECT holder FROM rebuild_locks WHERE name = ?1 AND expires_at > ?2",
            params![name, now_ms()],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| Error::operation("lock_holder", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_is_exclusive() {
        let locks = SqliteLockService::in_memory().unwrap();
        let ttl = Duration::from_secs(60);

        let token = locks.try_acquire("image", "w1", ttl).unwrap().unwrap();
        assert!(locks.try_acquire("image", "w2", ttl).unwrap().is_none());
        assert_eq!(locks.holder("image").unwrap().as_deref(), Some("w1"));

        assert!(locks.release(&token).unwrap());
        assert!(locks.holder("image").unwrap().is_none());
        assert!(locks.try_acquire("image", "w2", ttl).unwrap().is_some());
    }

    #[test]
    fn test_expired_lock_is_taken_over() {
        let locks = SqliteLockService::in_memory().unwrap();
        let stale = locks
            .try_acquire("image", "crashed", Duration::ZERO)
            .unwrap()
            .unwrap();

        let fresh = locks
            .try_acquire("image", "w2", Duration::from_secs(60))
            .unwrap()
            .unwrap();
        assert_eq!(fresh.holder, "w2");
        assert!(!locks.release(&stale).unwrap());
        assert!(locks.release(&fresh).unwrap());
    }

    #[test]
    fn test_shared_file_between_services() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("locks.db");
        let a = SqliteLockService::new(&path).unwrap();
        let b = SqliteLockService::new(&path).unwrap();
        let ttl = Duration::from_secs(60);

        let token = a.try_acquire("image", "a", ttl).unwrap().unwrap();
        assert!(b.try_acquire("image", "b", ttl).unwrap().is_none());
        assert!(a.release(&token).unwrap());
        assert!(b.try_acquire("image", "b", ttl).unwrap().is_some());
    }
}
