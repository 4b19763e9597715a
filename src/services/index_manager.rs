//! Index lifecycle manager.
//!
//! Owns the per-process active index and keeps it fresh:
//!
//! ```text
//! NoIndex -> Loading -> Fresh -> Stale -> Rebuilding -> Fresh (next generation)
//! ```
//!
//! - A persisted index younger than the keep-alive window is used as-is.
//! - Once stale, exactly one worker (the holder of the rebuild lock) streams
//!   every hash from the store, builds a new forest, writes it to a temp file
//!   and renames it over the canonical path.
//! - Workers with no generation at all back off and re-read the canonical
//!   file while a peer holds the lock; if the peer finishes in the meantime
//!   they pick up its generation instead of rebuilding.
//! - Workers already serving a stale generation make a single lock attempt.
//!   When it fails they keep serving and do not try again until the refresh
//!   cooldown has passed.
//! - Readers hold an `Arc` to the generation they queried, so a swap never
//!   cancels an in-flight query.
//! - A failed rebuild leaves the previous generation serving. Only when there
//!   is no generation at all does a check fail, with `NoIndexAvailable`.
//!
//! The rebuild lock is released after a successful build and when the hash
//! store goes away mid-scan. Any other failure leaves it to expire by TTL.

use crate::config::RepostConfig;
use crate::index::{ApproximateIndex, DEFAULT_LEAF_SIZE};
use crate::models::{BuildRecord, IndexGeneration, IndexState};
use crate::services::RetryPolicy;
use crate::storage::{BuildLog, HashStore, LockService, LockToken};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, TryLockError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Name of the rebuild lock shared by all workers.
pub const REBUILD_LOCK_NAME: &str = "image-index-rebuild";

/// Index type recorded in build records.
pub const INDEX_TYPE: &str = "image";

/// Static parameters of one manager.
#[derive(Debug, Clone)]
pub struct IndexManagerSettings {
    /// Vector dimension (hash bits).
    pub dimension: usize,
    /// Trees per build.
    pub tree_count: usize,
    /// Maximum items per leaf.
    pub leaf_size: usize,
    /// Age after which an index is stale.
    pub keep_alive: Duration,
    /// Rebuild lock TTL.
    pub lock_ttl: Duration,
    /// Rows per hash store page during a rebuild.
    pub page_size: usize,
    /// Upper bound of the random delay before the first lock attempt.
    pub jitter: Duration,
    /// Minimum wait between refresh attempts while a stale index serves.
    pub refresh_cooldown: Duration,
    /// Canonical index file.
    pub index_path: PathBuf,
    /// Lock holder identity.
    pub machine_id: String,
    /// Fixed forest seed (reproducible builds).
    pub seed: Option<u64>,
}

impl IndexManagerSettings {
    /// Derives settings from the crate configuration.
    #[must_use]
    pub fn from_config(config: &RepostConfig) -> Self {
        Self {
            dimension: config.dimension(),
            tree_count: config.index_tree_count,
            leaf_size: DEFAULT_LEAF_SIZE,
            keep_alive: config.index_keep_alive,
            lock_ttl: config.rebuild_lock_ttl,
            page_size: config.rebuild_page_size,
            jitter: config.rebuild_jitter,
            refresh_cooldown: config.index_refresh_cooldown,
            index_path: config.index_path(),
            machine_id: config.machine_id.clone(),
            seed: None,
        }
    }
}

/// One built or loaded index generation.
#[derive(Debug)]
pub struct ActiveIndex {
    index: ApproximateIndex,
    generation: IndexGeneration,
}

impl ActiveIndex {
    /// The queryable index.
    #[must_use]
    pub const fn index(&self) -> &ApproximateIndex {
        &self.index
    }

    /// Metadata of this generation.
    #[must_use]
    pub const fn generation(&self) -> &IndexGeneration {
        &self.generation
    }

    /// Time since the generation was written.
    #[must_use]
    pub fn age(&self) -> Duration {
        (Utc::now() - self.generation.build_end)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    fn is_fresh(&self, keep_alive: Duration) -> bool {
        self.age() < keep_alive
    }
}

/// Snapshot for operators.
#[derive(Debug, Clone, serde::Serialize)]
pub struct IndexStatus {
    /// Current lifecycle state.
    pub state: IndexState,
    /// Active generation, if any.
    pub generation: Option<IndexGeneration>,
    /// Age of the active generation in seconds.
    pub age_secs: Option<u64>,
    /// Current holder of the rebuild lock.
    pub lock_holder: Option<String>,
    /// Most recent build record.
    pub last_build: Option<BuildRecord>,
    /// How long the most recent build took, in seconds.
    pub last_build_secs: Option<i64>,
}

enum LockOutcome {
    Held(LockToken),
    PeerBuilt(Arc<ActiveIndex>),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Keeps the per-process index fresh and coordinates rebuilds.
pub struct IndexLifecycleManager {
    settings: IndexManagerSettings,
    store: Arc<dyn HashStore>,
    locks: Arc<dyn LockService>,
    build_log: Option<Arc<dyn BuildLog>>,
    retry: RetryPolicy,
    active: RwLock<Option<Arc<ActiveIndex>>>,
    state: RwLock<IndexState>,
    refresh: Mutex<()>,
    next_refresh: Mutex<Option<Instant>>,
}

impl IndexLifecycleManager {
    /// Creates a manager with no index loaded.
    #[must_use]
    pub fn new(
        settings: IndexManagerSettings,
        store: Arc<dyn HashStore>,
        locks: Arc<dyn LockService>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            settings,
            store,
            locks,
            build_log: None,
            retry,
            active: RwLock::new(None),
            state: RwLock::new(IndexState::NoIndex),
            refresh: Mutex::new(()),
            next_refresh: Mutex::new(None),
        }
    }

    /// Creates a manager from the crate configuration.
    #[must_use]
    pub fn from_config(
        config: &RepostConfig,
        store: Arc<dyn HashStore>,
        locks: Arc<dyn LockService>,
    ) -> Self {
        Self::new(
            IndexManagerSettings::from_config(config),
            store,
            locks,
            RetryPolicy::from_config(config),
        )
    }

    /// Records every successful build in `build_log`.
    #[must_use]
    pub fn with_build_log(mut self, build_log: Arc<dyn BuildLog>) -> Self {
        self.build_log = Some(build_log);
        self
    }

    /// Returns the settings.
    #[must_use]
    pub const fn settings(&self) -> &IndexManagerSettings {
        &self.settings
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> IndexState {
        *self
            .state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Metadata of the active generation.
    #[must_use]
    pub fn generation(&self) -> Option<IndexGeneration> {
        self.current().map(|active| active.generation.clone())
    }

    /// The active generation without any freshness check.
    #[must_use]
    pub fn current(&self) -> Option<Arc<ActiveIndex>> {
        self.active
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Returns a fresh index, loading or rebuilding as needed.
    ///
    /// A stale generation is returned when no fresh one can be produced.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoIndexAvailable`] when there is no generation at all
    /// and none could be loaded or built within the lock retry budget.
    #[instrument(skip(self), fields(machine_id = %self.settings.machine_id))]
    pub fn ensure_fresh(&self) -> Result<Arc<ActiveIndex>> {
        if let Some(active) = self.current() {
            if active.is_fresh(self.settings.keep_alive) {
                return Ok(active);
            }
            self.set_state(IndexState::Stale);
            if self.in_cooldown() {
                return Ok(active);
            }
            let _guard = match self.refresh.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => return Ok(active),
            };
            return self.refresh_locked(Some(active));
        }

        let _guard = lock(&self.refresh);
        let current = self.current();
        if let Some(active) = &current
            && active.is_fresh(self.settings.keep_alive)
        {
            return Ok(Arc::clone(active));
        }
        self.refresh_locked(current)
    }

    /// Rebuilds now, regardless of freshness. Still honours the lock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockUnavailable`] if the lock stays held through the
    /// retry budget, or the rebuild error.
    #[instrument(skip(self), fields(machine_id = %self.settings.machine_id))]
    pub fn force_rebuild(&self) -> Result<IndexGeneration> {
        let _guard = lock(&self.refresh);
        let previous = self.state();
        let result = self.rebuild_under_lock(true, true);
        if result.is_err() {
            self.set_state(if self.current().is_some() {
                previous
            } else {
                IndexState::NoIndex
            });
        }
        result.map(|active| active.generation.clone())
    }

    /// Operator snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock service or build log cannot be read.
    pub fn status(&self) -> Result<IndexStatus> {
        let current = self.current();
        let last_build = match &self.build_log {
            Some(log) => log.last_build(INDEX_TYPE)?,
            None => None,
        };
        Ok(IndexStatus {
            state: self.state(),
            generation: current.as_ref().map(|a| a.generation.clone()),
            age_secs: current.as_ref().map(|a| a.age().as_secs()),
            lock_holder: self.locks.holder(REBUILD_LOCK_NAME)?,
            last_build_secs: last_build.as_ref().map(BuildRecord::duration_secs),
            last_build,
        })
    }

    /// Load-then-rebuild, with the refresh guard held.
    fn refresh_locked(&self, fallback: Option<Arc<ActiveIndex>>) -> Result<Arc<ActiveIndex>> {
        self.set_state(IndexState::Loading);
        let mut fallback = fallback;

        match self.load_from_disk(fallback.as_deref()) {
            Ok(Some(loaded)) => {
                let loaded = Arc::new(loaded);
                if loaded.is_fresh(self.settings.keep_alive) {
                    self.activate(Arc::clone(&loaded));
                    return Ok(loaded);
                }
                debug!(
                    age_secs = loaded.age().as_secs(),
                    "persisted index is stale, serving it until rebuilt"
                );
                self.install(Arc::clone(&loaded), IndexState::Stale);
                fallback = Some(loaded);
            },
            Ok(None) => {},
            Err(e @ Error::FormatMismatch { .. }) => {
                warn!(error = %e, "persisted index has the wrong dimension, rebuilding");
            },
            Err(e) => warn!(error = %e, "persisted index unreadable, rebuilding"),
        }

        self.set_state(IndexState::Stale);
        let wait = fallback.is_none();
        match self.rebuild_under_lock(false, wait) {
            Ok(active) => Ok(active),
            Err(e) => {
                self.start_cooldown();
                if let Some(stale) = fallback {
                    warn!(error = %e, "rebuild not possible, serving stale index");
                    self.set_state(IndexState::Stale);
                    Ok(stale)
                } else {
                    self.set_state(IndexState::NoIndex);
                    metrics::counter!("repostscan_index_unavailable_total").increment(1);
                    Err(Error::NoIndexAvailable(e.to_string()))
                }
            },
        }
    }

    /// Takes the lock, then rebuilds.
    ///
    /// With `wait` the first attempt is jittered and a held lock is retried
    /// with backoff; without it a held lock fails at once.
    fn rebuild_under_lock(&self, force: bool, wait: bool) -> Result<Arc<ActiveIndex>> {
        let single_attempt = RetryPolicy::no_retry();
        let retry = if wait {
            self.sleep_jitter();
            &self.retry
        } else {
            &single_attempt
        };

        let outcome = retry.run(
            "acquire_rebuild_lock",
            |attempt| {
                if !force
                    && attempt > 1
                    && let Some(peer) = self.fresh_from_disk()
                {
                    return Ok(LockOutcome::PeerBuilt(peer));
                }
                match self.locks.try_acquire(
                    REBUILD_LOCK_NAME,
                    &self.settings.machine_id,
                    self.settings.lock_ttl,
                )? {
                    Some(token) => Ok(LockOutcome::Held(token)),
                    None => {
                        metrics::counter!("repostscan_rebuild_lock_contention_total").increment(1);
                        Err(Error::LockUnavailable {
                            name: REBUILD_LOCK_NAME.to_string(),
                        })
                    },
                }
            },
            Error::is_retryable,
        )?;

        let token = match outcome {
            LockOutcome::PeerBuilt(peer) => {
                info!(
                    items = peer.generation.item_count,
                    "picked up index rebuilt by another worker"
                );
                self.activate(Arc::clone(&peer));
                return Ok(peer);
            },
            LockOutcome::Held(token) => token,
        };

        if !force && let Some(peer) = self.fresh_from_disk() {
            self.release(&token);
            self.activate(Arc::clone(&peer));
            return Ok(peer);
        }

        self.set_state(IndexState::Rebuilding);
        match self.rebuild() {
            Ok(active) => {
                self.release(&token);
                self.activate(Arc::clone(&active));
                Ok(active)
            },
            Err(e) => {
                metrics::counter!("repostscan_index_rebuild_failures_total").increment(1);
                error!(error = %e, "index rebuild failed");
                if matches!(e, Error::DataSourceUnavailable { .. }) {
                    self.release(&token);
                }
                Err(e)
            },
        }
    }

    /// Streams the hash store into a new index and publishes it on disk.
    #[instrument(skip(self), fields(page_size = self.settings.page_size))]
    fn rebuild(&self) -> Result<Arc<ActiveIndex>> {
        let build_start = Utc::now();
        let timer = Instant::now();
        let settings = &self.settings;

        let mut index =
            ApproximateIndex::new(settings.dimension)?.with_leaf_size(settings.leaf_size);
        if let Some(seed) = settings.seed {
            index = index.with_seed(seed);
        }

        let mut after = None;
        let mut pages = 0usize;
        let mut skipped = 0usize;
        loop {
            let page = self.store.page_hashes_after(after, settings.page_size)?;
            pages += 1;
            for (row_id, hash) in &page.rows {
                if let Err(e) = index.add_hash(*row_id, hash) {
                    skipped += 1;
                    debug!(row_id, error = %e, "skipping hash");
                }
            }
            if page.is_last(settings.page_size) || page.last_row_id.is_none() {
                break;
            }
            after = page.last_row_id;
        }

        index.build(settings.tree_count)?;
        publish(&index, &settings.index_path)?;
        let build_end = Utc::now();

        let generation = IndexGeneration {
            dimension: settings.dimension,
            tree_count: settings.tree_count,
            item_count: index.item_count(),
            build_start,
            build_end,
            path: settings.index_path.clone(),
        };
        self.record_build(&generation);

        let elapsed = timer.elapsed();
        metrics::counter!("repostscan_index_rebuilds_total").increment(1);
        metrics::histogram!("repostscan_index_rebuild_duration_ms")
            .record(elapsed.as_secs_f64() * 1000.0);
        info!(
            items = generation.item_count,
            pages,
            skipped,
            duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            "index rebuilt"
        );

        Ok(Arc::new(ActiveIndex { index, generation }))
    }

    fn record_build(&self, generation: &IndexGeneration) {
        let Some(log) = &self.build_log else {
            return;
        };
        let record = BuildRecord {
            index_type: INDEX_TYPE.to_string(),
            hostname: self.settings.machine_id.clone(),
            item_count: generation.item_count,
            build_start: generation.build_start,
            build_end: generation.build_end,
        };
        if let Err(e) = log.record_build(&record) {
            warn!(error = %e, "failed to record index build");
        }
    }

    /// Loads the canonical file if it is newer than `current`.
    fn load_from_disk(&self, current: Option<&ActiveIndex>) -> Result<Option<ActiveIndex>> {
        let path = &self.settings.index_path;
        let written: DateTime<Utc> = match fs::metadata(path).and_then(|m| m.modified()) {
            Ok(modified) => modified.into(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::operation("stat_index", e)),
        };
        if current.is_some_and(|c| c.generation.build_end >= written) {
            return Ok(None);
        }

        let index = ApproximateIndex::load(path, self.settings.dimension)?;
        debug!(items = index.item_count(), path = %path.display(), "loaded persisted index");
        let generation = IndexGeneration {
            dimension: index.dimension(),
            tree_count: index.tree_count(),
            item_count: index.item_count(),
            build_start: written,
            build_end: written,
            path: path.clone(),
        };
        Ok(Some(ActiveIndex { index, generation }))
    }

    fn fresh_from_disk(&self) -> Option<Arc<ActiveIndex>> {
        let current = self.current();
        match self.load_from_disk(current.as_deref()) {
            Ok(Some(loaded)) if loaded.is_fresh(self.settings.keep_alive) => Some(Arc::new(loaded)),
            Ok(_) => None,
            Err(e) => {
                debug!(error = %e, "no usable index on disk");
                None
            },
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn activate(&self, active: Arc<ActiveIndex>) {
        metrics::gauge!("repostscan_index_items").set(active.generation.item_count as f64);
        self.install(active, IndexState::Fresh);
        *lock(&self.next_refresh) = None;
    }

    fn install(&self, active: Arc<ActiveIndex>, state: IndexState) {
        *self
            .active
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(active);
        self.set_state(state);
    }

    fn set_state(&self, state: IndexState) {
        *self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = state;
    }

    fn release(&self, token: &LockToken) {
        match self.locks.release(token) {
            Ok(true) => {},
            Ok(false) => warn!(lock = %token.name, "rebuild lock expired before release"),
            Err(e) => warn!(error = %e, "failed to release rebuild lock, it will expire"),
        }
    }

    fn in_cooldown(&self) -> bool {
        lock(&self.next_refresh).is_some_and(|at| Instant::now() < at)
    }

    fn start_cooldown(&self) {
        *lock(&self.next_refresh) = Some(Instant::now() + self.settings.refresh_cooldown);
    }

    fn sleep_jitter(&self) {
        let max_ms = u64::try_from(self.settings.jitter.as_millis()).unwrap_or(u64::MAX);
        if max_ms == 0 {
            return;
        }
        let delay = rand::rng().random_range(0..=max_ms);
        std::thread::sleep(Duration::from_millis(delay));
    }
}

/// Writes `index` next to `path` and renames it into place.
fn publish(index: &ApproximateIndex, path: &Path) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(
        "{file_name}.tmp-{}",
        uuid::Uuid::new_v4().simple()
    ));

    let result = index
        .save(&tmp)
        .and_then(|()| fs::rename(&tmp, path).map_err(|e| Error::operation("rename_index", e)));
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::ImageHash;
    use crate::models::Post;
    use crate::storage::{MemoryBuildLog, MemoryHashStore, MemoryLockService};
    use tempfile::TempDir;

    fn settings(dir: &TempDir) -> IndexManagerSettings {
        IndexManagerSettings {
            dimension: 32,
            tree_count: 4,
            leaf_size: 4,
            keep_alive: Duration::from_secs(3600),
            lock_ttl: Duration::from_secs(60),
            page_size: 3,
            jitter: Duration::ZERO,
            refresh_cooldown: Duration::ZERO,
            index_path: dir.path().join("index.rpx"),
            machine_id: "test-worker".to_string(),
            seed: Some(7),
        }
    }

    fn store(count: u32) -> Arc<MemoryHashStore> {
        let store = MemoryHashStore::new();
        for i in 0..count {
            let post = Post::new(0, format!("p{i}"), "a", i64::from(i))
                .with_hash(ImageHash::from_bytes(i.to_be_bytes().to_vec()));
            store.insert_post(post);
        }
        Arc::new(store)
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(2, Duration::from_millis(1))
    }

    #[test]
    fn test_first_use_rebuilds_and_records() {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(MemoryBuildLog::new());
        let manager = IndexLifecycleManager::new(
            settings(&dir),
            store(10),
            Arc::new(MemoryLockService::new()),
            fast_retry(),
        )
        .with_build_log(log.clone());

        assert_eq!(manager.state(), IndexState::NoIndex);
        let active = manager.ensure_fresh().unwrap();
        assert_eq!(active.index().item_count(), 10);
        assert_eq!(manager.state(), IndexState::Fresh);
        assert!(dir.path().join("index.rpx").exists());

        let records = log.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].item_count, 10);
        assert_eq!(records[0].hostname, "test-worker");
    }

    #[test]
    fn test_fresh_index_is_reused() {
        let dir = TempDir::new().unwrap();
        let manager = IndexLifecycleManager::new(
            settings(&dir),
            store(5),
            Arc::new(MemoryLockService::new()),
            fast_retry(),
        );
        let first = manager.ensure_fresh().unwrap();
        let second = manager.ensure_fresh().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let manager = IndexLifecycleManager::new(
            settings(&dir),
            store(5),
            Arc::new(MemoryLockService::new()),
            fast_retry(),
        );
        manager.ensure_fresh().unwrap();
        manager.force_rebuild().unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["index.rpx".to_string()]);
    }

    #[test]
    fn test_stale_generation_does_not_wait_for_lock() {
        let dir = TempDir::new().unwrap();
        let locks = Arc::new(MemoryLockService::new());
        let mut settings = settings(&dir);
        settings.keep_alive = Duration::from_millis(50);
        let manager = IndexLifecycleManager::new(
            settings,
            store(4),
            locks.clone(),
            RetryPolicy::new(4, Duration::from_millis(200)),
        );
        let first = manager.ensure_fresh().unwrap();
        locks
            .try_acquire(REBUILD_LOCK_NAME, "peer", Duration::from_secs(60))
            .unwrap()
            .unwrap();
        std::thread::sleep(Duration::from_millis(80));

        let started = Instant::now();
        let served = manager.ensure_fresh().unwrap();
        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(Arc::ptr_eq(&first, &served));
        assert_eq!(manager.state(), IndexState::Stale);
    }

    #[test]
    fn test_refresh_cooldown_comes_from_config() {
        let config = RepostConfig {
            index_refresh_cooldown: Duration::from_secs(90),
            ..RepostConfig::default()
        };
        let settings = IndexManagerSettings::from_config(&config);
        assert_eq!(settings.refresh_cooldown, Duration::from_secs(90));
        assert_ne!(settings.refresh_cooldown, config.lock_retry_backoff);
    }

    #[test]
    fn test_lock_released_after_success() {
        let dir = TempDir::new().unwrap();
        let locks = Arc::new(MemoryLockService::new());
        let manager =
            IndexLifecycleManager::new(settings(&dir), store(5), locks.clone(), fast_retry());
        manager.ensure_fresh().unwrap();
        assert!(locks.holder(REBUILD_LOCK_NAME).unwrap().is_none());
    }
}
