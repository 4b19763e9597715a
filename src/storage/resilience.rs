//! Hash store wrapper that stops calling an unreachable database.
//!
//! A rebuild pages through millions of rows; when the post database goes
//! away mid-scan every further page would wait out its own timeout. After
//! `failure_threshold` consecutive transient failures the wrapper stops
//! forwarding calls for `reset_timeout` and answers `DataSourceUnavailable`
//! straight away, so the lifecycle manager can abort and keep serving the
//! previous index.
//!
//! ```text
//! closed --(threshold transient failures)--> open
//! open   --(reset timeout elapsed)---------> one trial call
//! trial  --(store answered)----------------> closed
//! trial  --(transient failure)-------------> open
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use repostscan::storage::{ResilientHashStore, SqliteHashStore, StoreResilienceConfig};
//!
//! let store = SqliteHashStore::new(db_path)?;
//! let resilient = ResilientHashStore::new(store, StoreResilienceConfig::default(), "sqlite");
//! let page = resilient.page_hashes_after(None, 10_000)?;
//! ```

use super::traits::{HashPage, HashStore};
use crate::hashing::ImageHash;
use crate::models::{MemeTemplate, Post, PostId, RowId};
use crate::{Error, Result};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// When the wrapper gives up on a store and when it tries again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreResilienceConfig {
    /// Consecutive transient failures before calls stop being forwarded.
    pub failure_threshold: u32,
    /// How long calls are refused before a single trial call is let through.
    pub reset_timeout: Duration,
}

impl Default for StoreResilienceConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

impl StoreResilienceConfig {
    /// Reads `REPOSTSCAN_STORE_BREAKER_THRESHOLD` and
    /// `REPOSTSCAN_STORE_BREAKER_RESET_MS`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_overrides(&|key| std::env::var(key).ok())
    }

    /// Applies overrides from a variable lookup. Unparseable values are
    /// ignored.
    #[must_use]
    pub fn with_overrides(mut self, lookup: &impl Fn(&str) -> Option<String>) -> Self {
        if let Some(threshold) =
            lookup("REPOSTSCAN_STORE_BREAKER_THRESHOLD").and_then(|v| v.parse::<u32>().ok())
        {
            self = self.with_failure_threshold(threshold);
        }
        if let Some(ms) =
            lookup("REPOSTSCAN_STORE_BREAKER_RESET_MS").and_then(|v| v.parse::<u64>().ok())
        {
            self.reset_timeout = Duration::from_millis(ms);
        }
        self
    }

    /// Sets the failure threshold (at least 1).
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Sets the reset timeout.
    #[must_use]
    pub const fn with_reset_timeout(mut self, reset_timeout: Duration) -> Self {
        self.reset_timeout = reset_timeout;
        self
    }
}

/// Whether a call reaches the inner store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Forward,
    Trial,
    Refuse,
}

/// Failure bookkeeping for one wrapped store.
#[derive(Debug, Default)]
struct StoreHealth {
    consecutive_failures: u32,
    refused_until: Option<Instant>,
    trial_running: bool,
}

impl StoreHealth {
    fn admit(&mut self, now: Instant) -> Admission {
        match self.refused_until {
            None => Admission::Forward,
            Some(until) if now < until || self.trial_running => Admission::Refuse,
            Some(_) => {
                self.trial_running = true;
                Admission::Trial
            },
        }
    }

    /// Records the outcome of a forwarded call. Returns `true` when this
    /// failure starts a refusal window.
    fn settle(&mut self, transient_failure: bool, config: &StoreResilienceConfig) -> bool {
        if !transient_failure {
            *self = Self::default();
            return false;
        }
        let was_trial = std::mem::take(&mut self.trial_running);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if was_trial || self.consecutive_failures >= config.failure_threshold {
            self.refused_until = Some(Instant::now() + config.reset_timeout);
            return true;
        }
        false
    }

    /// 0 forwarding, 1 refusing, 2 trial in progress.
    const fn gauge_value(&self) -> u8 {
        match (self.refused_until, self.trial_running) {
            (None, _) => 0,
            (Some(_), false) => 1,
            (Some(_), true) => 2,
        }
    }
}

/// [`HashStore`] wrapper that fails fast while the inner store is down.
///
/// Only transient errors (see [`Error::is_retryable`]) count as failures;
/// an unknown row id passed to `update_hash` means the store answered.
pub struct ResilientHashStore<S: HashStore> {
    inner: S,
    config: StoreResilienceConfig,
    health: Mutex<StoreHealth>,
    backend_name: &'static str,
}

impl<S: HashStore> ResilientHashStore<S> {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: S, config: StoreResilienceConfig, backend_name: &'static str) -> Self {
        Self {
            inner,
            config,
            health: Mutex::new(StoreHealth::default()),
            backend_name,
        }
    }

    /// The wrapped store.
    pub const fn inner(&self) -> &S {
        &self.inner
    }

    fn health(&self) -> MutexGuard<'_, StoreHealth> {
        self.health
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn execute<T>(&self, operation: &'static str, call: impl FnOnce() -> Result<T>) -> Result<T> {
        let admission = self.health().admit(Instant::now());
        if admission == Admission::Refuse {
            self.record_metrics(operation, "circuit_open");
            return Err(Error::data_source(
                operation,
                format!("circuit breaker open for backend '{}'", self.backend_name),
            ));
        }
        if admission == Admission::Trial {
            tracing::info!(backend = self.backend_name, operation, "trying hash store again");
        }

        let result = call();
        let transient = result.as_ref().is_err_and(Error::is_retryable);
        let tripped = self.health().settle(transient, &self.config);

        if tripped {
            tracing::warn!(
                backend = self.backend_name,
                operation,
                retry_in_ms = u64::try_from(self.config.reset_timeout.as_millis()).unwrap_or(u64::MAX),
                "hash store unreachable, refusing calls"
            );
            metrics::counter!(
                "repostscan_store_breaker_trips_total",
                "backend" => self.backend_name,
                "operation" => operation
            )
            .increment(1);
        } else if admission == Admission::Trial && !transient {
            tracing::info!(backend = self.backend_name, "hash store reachable again");
        }
        self.record_metrics(operation, if result.is_ok() { "success" } else { "error" });

        result
    }

    fn record_metrics(&self, operation: &'static str, status: &'static str) {
        metrics::counter!(
            "repostscan_store_requests_total",
            "backend" => self.backend_name,
            "operation" => operation,
            "status" => status
        )
        .increment(1);
        let state = self.health().gauge_value();
        metrics::gauge!("repostscan_store_breaker_state", "backend" => self.backend_name)
            .set(f64::from(state));
    }
}

impl<S: HashStore> HashStore for ResilientHashStore<S> {
    fn page_hashes(&self, offset: usize, limit: usize) -> Result<HashPage> {
        self.execute("page_hashes", || self.inner.page_hashes(offset, limit))
    }

    fn page_hashes_after(&self, after: Option<RowId>, limit: usize) -> Result<HashPage> {
        self.execute("page_hashes_after", || {
            self.inner.page_hashes_after(after, limit)
        })
    }

    fn count_hashes(&self) -> Result<usize> {
        self.execute("count_hashes", || self.inner.count_hashes())
    }

    fn get_post(&self, row_id: RowId) -> Result<Option<Post>> {
        self.execute("get_post", || self.inner.get_post(row_id))
    }

    fn get_posts(&self, row_ids: &[RowId]) -> Result<Vec<Option<Post>>> {
        self.execute("get_posts", || self.inner.get_posts(row_ids))
    }

    fn get_post_by_post_id(&self, post_id: &PostId) -> Result<Option<Post>> {
        self.execute("get_post_by_post_id", || {
            self.inner.get_post_by_post_id(post_id)
        })
    }

    fn get_hash_by_post_id(&self, post_id: &PostId) -> Result<Option<ImageHash>> {
        self.execute("get_hash_by_post_id", || {
            self.inner.get_hash_by_post_id(post_id)
        })
    }

    fn update_hash(&self, row_id: RowId, hash: &ImageHash) -> Result<()> {
        self.execute("update_hash", || self.inner.update_hash(row_id, hash))
    }

    fn meme_templates(&self) -> Result<Vec<MemeTemplate>> {
        self.execute("meme_templates", || self.inner.meme_templates())
    }
}
