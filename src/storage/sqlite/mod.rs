//! `SQLite` storage backends.
//!
//! - [`SqliteHashStore`]: posts, hashes, meme templates and build records
//! - [`SqliteLockService`]: TTL rebuild lock in a shared database file
//!
//! Both keep their own `Mutex<Connection>`; WAL journaling lets several
//! worker processes read while one writes.

mod connection;
mod hash_store;
mod lock;
mod metrics;

pub use connection::{BUSY_TIMEOUT_MS, acquire_lock, configure_connection, to_sql_id};
pub use hash_store::SqliteHashStore;
pub use lock::SqliteLockService;
pub use metrics::record_operation;
