//! Rebuild lock trait.
//!
//! The lock is advisory: it only coordinates processes that ask for it.
//! Every lock carries a TTL so a holder that crashes mid-rebuild stops
//! blocking its peers once the TTL runs out.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Proof of a held lock, needed to release it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockToken {
    /// Lock name.
    pub name: String,
    /// Holder identity (machine id).
    pub holder: String,
    /// Unique value for this acquisition.
    pub token: String,
    /// Expiry, Unix milliseconds.
    pub expires_at_ms: i64,
}

impl LockToken {
    /// Creates a token for a fresh acquisition.
    #[must_use]
    pub fn new(name: &str, holder: &str, ttl: Duration) -> Self {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        Self {
            name: name.to_string(),
            holder: holder.to_string(),
            token: uuid::Uuid::now_v7().to_string(),
            expires_at_ms: now_ms().saturating_add(ttl_ms),
        }
    }
}

/// Current time in Unix milliseconds.
#[must_use]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Distributed, TTL-bound mutual exclusion.
pub trait LockService: Send + Sync {
    /// Tries once to take `name` for `holder`.
    ///
    /// Returns `Ok(None)` when another holder has it and it has not expired.
    ///
    /// # Errors
    ///
    /// Returns an error if the coordination store cannot be reached.
    fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> Result<Option<LockToken>>;

    /// Releases a lock taken with [`Self::try_acquire`].
    ///
    /// Returns `false` if the lock had already expired or was taken over.
    ///
    /// # Errors
    ///
    /// Returns an error if the coordination store cannot be reached.
    fn release(&self, token: &LockToken) -> Result<bool>;

    /// Current unexpired holder of `name`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the coordination store cannot be reached.
    fn holder(&self, name: &str) -> Result<Option<String>>;
}
