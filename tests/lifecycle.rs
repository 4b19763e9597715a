//! Index lifecycle tests: staleness, peer rebuilds, failure recovery.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use repostscan::hashing::ImageHash;
use repostscan::index::ApproximateIndex;
use repostscan::models::IndexState;
use repostscan::services::{ActiveIndex, IndexManagerSettings, REBUILD_LOCK_NAME};
use repostscan::storage::{
    LockService, LockToken, MemoryBuildLog, MemoryHashStore, MemoryLockService, SqliteHashStore,
    SqliteLockService,
};
use repostscan::{Error, IndexLifecycleManager, Post, Result, RetryPolicy};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn settings(dir: &TempDir, machine_id: &str) -> IndexManagerSettings {
    IndexManagerSettings {
        dimension: 32,
        tree_count: 4,
        leaf_size: 4,
        keep_alive: Duration::from_secs(3600),
        lock_ttl: Duration::from_secs(60),
        page_size: 4,
        jitter: Duration::ZERO,
        refresh_cooldown: Duration::ZERO,
        index_path: dir.path().join("image_index.rpx"),
        machine_id: machine_id.to_string(),
        seed: Some(3),
    }
}

fn seeded_store(count: u32) -> Arc<MemoryHashStore> {
    let store = MemoryHashStore::new();
    for i in 1..=count {
        store.insert_post(
            Post::new(0, format!("p{i}"), "author", i64::from(i))
                .with_hash(ImageHash::from_bytes(i.to_be_bytes().to_vec())),
        );
    }
    Arc::new(store)
}

fn write_index(path: &Path, dimension: usize, items: u32) {
    let mut index = ApproximateIndex::new(dimension).unwrap().with_seed(9);
    let bytes = dimension / 8;
    for i in 1..=items {
        let mut vector = vec![0u8; bytes];
        vector[bytes - 1] = u8::try_from(i).unwrap();
        index.add_item(u64::from(i), &vector).unwrap();
    }
    index.build(2).unwrap();
    let tmp = path.with_extension("writing");
    index.save(&tmp).unwrap();
    std::fs::rename(&tmp, path).unwrap();
}

#[test]
fn test_stale_index_is_rebuilt() {
    let dir = TempDir::new().unwrap();
    let store = seeded_store(6);
    let log = Arc::new(MemoryBuildLog::new());
    let mut settings = settings(&dir, "worker-a");
    settings.keep_alive = Duration::from_millis(200);
    let manager = IndexLifecycleManager::new(
        settings,
        store.clone(),
        Arc::new(MemoryLockService::new()),
        RetryPolicy::no_retry(),
    )
    .with_build_log(log.clone());

    let first = manager.ensure_fresh().unwrap();
    assert_eq!(first.index().item_count(), 6);

    store.insert_post(Post::new(0, "late", "b", 99).with_hash(ImageHash::from_bytes(vec![7; 4])));
    thread::sleep(Duration::from_millis(300));

    let second = manager.ensure_fresh().unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(second.index().item_count(), 7);
    assert!(second.generation().build_end > first.generation().build_end);
    assert_eq!(manager.state(), IndexState::Fresh);
    assert_eq!(log.records().len(), 2);
}

#[test]
fn test_in_flight_reader_keeps_old_generation() {
    let dir = TempDir::new().unwrap();
    let store = seeded_store(3);
    let manager = IndexLifecycleManager::new(
        settings(&dir, "worker-a"),
        store.clone(),
        Arc::new(MemoryLockService::new()),
        RetryPolicy::no_retry(),
    );

    let held = manager.ensure_fresh().unwrap();
    store.insert_post(Post::new(0, "extra", "b", 9).with_hash(ImageHash::from_bytes(vec![1; 4])));
    manager.force_rebuild().unwrap();

    assert_eq!(held.index().item_count(), 3);
    let query = held
        .index()
        .query_hash(&ImageHash::from_bytes(vec![0, 0, 0, 1]), 3, 0)
        .unwrap();
    assert_eq!(query[0].row_id, 1);
    assert_eq!(manager.current().unwrap().index().item_count(), 4);
}

#[test]
fn test_second_worker_loads_published_index() {
    let dir = TempDir::new().unwrap();
    let store = seeded_store(5);
    let locks = Arc::new(MemoryLockService::new());
    let log = Arc::new(MemoryBuildLog::new());

    let a = IndexLifecycleManager::new(
        settings(&dir, "worker-a"),
        store.clone(),
        locks.clone(),
        RetryPolicy::no_retry(),
    )
    .with_build_log(log.clone());
    let b = IndexLifecycleManager::new(
        settings(&dir, "worker-b"),
        store,
        locks,
        RetryPolicy::no_retry(),
    )
    .with_build_log(log.clone());

    a.ensure_fresh().unwrap();
    let loaded = b.ensure_fresh().unwrap();

    assert_eq!(loaded.index().item_count(), 5);
    assert_eq!(log.records().len(), 1);
    assert_eq!(log.records()[0].hostname, "worker-a");
}

#[test]
fn test_waiting_worker_picks_up_peer_build() {
    let dir = TempDir::new().unwrap();
    let locks = Arc::new(MemoryLockService::new());
    let token = locks
        .try_acquire(REBUILD_LOCK_NAME, "peer", Duration::from_secs(60))
        .unwrap()
        .unwrap();

    let path = dir.path().join("image_index.rpx");
    let peer_locks = locks.clone();
    let peer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        write_index(&path, 32, 11);
        peer_locks.release(&token).unwrap();
    });

    let log = Arc::new(MemoryBuildLog::new());
    let manager = IndexLifecycleManager::new(
        settings(&dir, "waiter"),
        seeded_store(2),
        locks,
        RetryPolicy::new(5, Duration::from_millis(150)),
    )
    .with_build_log(log.clone());

    let active = manager.ensure_fresh().unwrap();
    peer.join().unwrap();

    assert_eq!(active.index().item_count(), 11);
    assert!(log.records().is_empty());
}

#[test]
fn test_unreachable_store_keeps_old_index_and_releases_lock() {
    let dir = TempDir::new().unwrap();
    let store = seeded_store(4);
    let locks = Arc::new(MemoryLockService::new());
    let mut settings = settings(&dir, "worker-a");
    settings.keep_alive = Duration::from_millis(150);
    let manager = IndexLifecycleManager::new(
        settings,
        store.clone(),
        locks.clone(),
        RetryPolicy::no_retry(),
    );

    let first = manager.ensure_fresh().unwrap();
    thread::sleep(Duration::from_millis(250));
    store.set_unavailable(true);

    let served = manager.ensure_fresh().unwrap();
    assert!(Arc::ptr_eq(&first, &served));
    assert_eq!(manager.state(), IndexState::Stale);
    assert_eq!(locks.holder(REBUILD_LOCK_NAME).unwrap(), None);

    store.set_unavailable(false);
    let rebuilt = manager.ensure_fresh().unwrap();
    assert!(!Arc::ptr_eq(&first, &rebuilt));
    assert_eq!(manager.state(), IndexState::Fresh);
}

#[test]
fn test_store_failure_mid_scan_leaves_previous_file() {
    let dir = TempDir::new().unwrap();
    let store = seeded_store(12);
    let manager = IndexLifecycleManager::new(
        settings(&dir, "worker-a"),
        store.clone(),
        Arc::new(MemoryLockService::new()),
        RetryPolicy::no_retry(),
    );
    manager.ensure_fresh().unwrap();
    let before = std::fs::read(dir.path().join("image_index.rpx")).unwrap();

    store.fail_after_pages(Some(1));
    let err = manager.force_rebuild().unwrap_err();
    assert!(matches!(err, Error::DataSourceUnavailable { .. }), "got {err:?}");

    let after = std::fs::read(dir.path().join("image_index.rpx")).unwrap();
    assert_eq!(before, after);
    assert_eq!(manager.current().unwrap().index().item_count(), 12);
}

#[test]
fn test_wrong_dimension_file_forces_rebuild() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("image_index.rpx");
    write_index(&path, 64, 3);

    let manager = IndexLifecycleManager::new(
        settings(&dir, "worker-a"),
        seeded_store(5),
        Arc::new(MemoryLockService::new()),
        RetryPolicy::no_retry(),
    );
    let active = manager.ensure_fresh().unwrap();

    assert_eq!(active.index().dimension(), 32);
    assert_eq!(active.index().item_count(), 5);
    let header = ApproximateIndex::read_header(&path, 32).unwrap();
    assert_eq!(header.item_count, 5);
}

#[test]
fn test_corrupt_file_forces_rebuild() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("image_index.rpx"), b"not an index").unwrap();

    let manager = IndexLifecycleManager::new(
        settings(&dir, "worker-a"),
        seeded_store(2),
        Arc::new(MemoryLockService::new()),
        RetryPolicy::no_retry(),
    );
    assert_eq!(manager.ensure_fresh().unwrap().index().item_count(), 2);
}

#[test]
fn test_repeated_rebuilds_are_idempotent() {
    let dir = TempDir::new().unwrap();
    let manager = IndexLifecycleManager::new(
        settings(&dir, "worker-a"),
        seeded_store(9),
        Arc::new(MemoryLockService::new()),
        RetryPolicy::no_retry(),
    );

    let first = manager.force_rebuild().unwrap();
    let second = manager.force_rebuild().unwrap();
    assert_eq!(first.item_count, 9);
    assert_eq!(second.item_count, 9);
    assert!(second.build_end >= first.build_end);
}

#[test]
fn test_sqlite_backends_share_lock_and_log() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("repostscan.db");
    let store = Arc::new(SqliteHashStore::new(&db).unwrap());
    for i in 1..=4u32 {
        store
            .insert_post(
                &Post::new(0, format!("s{i}"), "a", i64::from(i))
                    .with_hash(ImageHash::from_bytes(i.to_be_bytes().to_vec())),
            )
            .unwrap();
    }
    let locks = Arc::new(SqliteLockService::new(&db).unwrap());
    let log = Arc::new(SqliteHashStore::new(&db).unwrap());

    let manager = IndexLifecycleManager::new(
        settings(&dir, "sqlite-worker"),
        store,
        locks.clone(),
        RetryPolicy::no_retry(),
    )
    .with_build_log(log);

    manager.ensure_fresh().unwrap();
    let status = manager.status().unwrap();
    assert_eq!(status.state, IndexState::Fresh);
    assert_eq!(status.lock_holder, None);
    assert!(status.last_build_secs.is_some_and(|secs| secs >= 0));
    let last = status.last_build.unwrap();
    assert_eq!(last.item_count, 4);
    assert_eq!(last.hostname, "sqlite-worker");
    assert_eq!(locks.holder(REBUILD_LOCK_NAME).unwrap(), None);
}

/// Lock service that counts acquisition attempts.
#[derive(Default)]
struct CountingLocks {
    inner: MemoryLockService,
    attempts: AtomicUsize,
}

impl CountingLocks {
    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl LockService for CountingLocks {
    fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> Result<Option<LockToken>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.inner.try_acquire(name, holder, ttl)
    }

    fn release(&self, token: &LockToken) -> Result<bool> {
        self.inner.release(token)
    }

    fn holder(&self, name: &str) -> Result<Option<String>> {
        self.inner.holder(name)
    }
}

/// Builds a generation, lets it go stale, then hands the lock to a peer.
fn stale_behind_peer(
    dir: &TempDir,
    locks: Arc<CountingLocks>,
    retry: RetryPolicy,
    refresh_cooldown: Duration,
) -> (IndexLifecycleManager, Arc<ActiveIndex>, LockToken) {
    let mut settings = settings(dir, "worker-a");
    settings.keep_alive = Duration::from_millis(100);
    settings.refresh_cooldown = refresh_cooldown;
    let manager = IndexLifecycleManager::new(settings, seeded_store(5), locks.clone(), retry);

    let first = manager.ensure_fresh().unwrap();
    let peer = locks
        .try_acquire(REBUILD_LOCK_NAME, "peer", Duration::from_secs(600))
        .unwrap()
        .unwrap();
    thread::sleep(Duration::from_millis(150));
    (manager, first, peer)
}

#[test]
fn test_lock_contention_serves_stale_generation() {
    let dir = TempDir::new().unwrap();
    let locks = Arc::new(CountingLocks::default());
    let (manager, first, _peer) = stale_behind_peer(
        &dir,
        locks.clone(),
        RetryPolicy::new(5, Duration::from_millis(100)),
        Duration::ZERO,
    );
    let before = locks.attempts();

    let served = manager.ensure_fresh().unwrap();

    assert!(Arc::ptr_eq(&first, &served));
    assert_eq!(manager.state(), IndexState::Stale);
    assert_eq!(locks.attempts() - before, 1);
    assert_eq!(locks.holder(REBUILD_LOCK_NAME).unwrap().as_deref(), Some("peer"));
    assert_eq!(served.index().item_count(), 5);
}

#[test]
fn test_stale_checks_are_not_blocked_by_peer_rebuild() {
    let dir = TempDir::new().unwrap();
    let locks = Arc::new(CountingLocks::default());
    let (manager, first, _peer) = stale_behind_peer(
        &dir,
        locks.clone(),
        RetryPolicy::new(5, Duration::from_millis(100)),
        Duration::from_millis(100),
    );

    let started = Instant::now();
    for _ in 0..30 {
        let served = manager.ensure_fresh().unwrap();
        assert!(Arc::ptr_eq(&first, &served));
    }
    assert!(
        started.elapsed() < Duration::from_millis(500),
        "checks blocked for {:?}",
        started.elapsed()
    );
    assert_eq!(manager.state(), IndexState::Stale);
}

#[test]
fn test_refresh_cooldown_skips_lock_attempts() {
    let dir = TempDir::new().unwrap();
    let locks = Arc::new(CountingLocks::default());
    let (manager, _first, _peer) = stale_behind_peer(
        &dir,
        locks.clone(),
        RetryPolicy::no_retry(),
        Duration::from_secs(60),
    );
    let before = locks.attempts();

    for _ in 0..10 {
        manager.ensure_fresh().unwrap();
    }

    assert_eq!(locks.attempts() - before, 1);
    assert_eq!(manager.state(), IndexState::Stale);
}

#[test]
fn test_stale_generation_replaced_once_peer_releases() {
    let dir = TempDir::new().unwrap();
    let locks = Arc::new(CountingLocks::default());
    let (manager, first, peer) = stale_behind_peer(
        &dir,
        locks.clone(),
        RetryPolicy::no_retry(),
        Duration::ZERO,
    );
    assert!(Arc::ptr_eq(&first, &manager.ensure_fresh().unwrap()));

    assert!(locks.release(&peer).unwrap());

    let rebuilt = manager.ensure_fresh().unwrap();
    assert!(!Arc::ptr_eq(&first, &rebuilt));
    assert_eq!(manager.state(), IndexState::Fresh);
}
