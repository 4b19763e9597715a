//! Storage backend traits.

mod build_log;
mod hash_store;
mod lock;

pub use build_log::BuildLog;
pub use hash_store::{HashPage, HashStore};
pub use lock::{LockService, LockToken, now_ms};
