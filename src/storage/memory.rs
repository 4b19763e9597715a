//! In-process storage backends.
//!
//! Used by tests and single-process deployments. The hash store supports
//! failure injection so rebuild abort paths can be exercised without a real
//! outage.

use crate::hashing::ImageHash;
use crate::models::{BuildRecord, MemeTemplate, Post, PostId, RowId};
use crate::storage::traits::{BuildLog, HashPage, HashStore, LockService, LockToken, now_ms};
use crate::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// In-memory [`HashStore`].
#[derive(Default)]
pub struct MemoryHashStore {
    posts: RwLock<BTreeMap<RowId, Post>>,
    templates: RwLock<Vec<MemeTemplate>>,
    unavailable: AtomicBool,
    fail_after_pages: Mutex<Option<usize>>,
    pages_served: AtomicUsize,
}

impl MemoryHashStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a post. A `row_id` of 0 gets the next free id.
    pub fn insert_post(&self, mut post: Post) -> RowId {
        let mut posts = self
            .posts
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if post.row_id == 0 {
            post.row_id = posts.keys().next_back().map_or(1, |last| last + 1);
        }
        let row_id = post.row_id;
        posts.insert(row_id, post);
        row_id
    }

    /// Adds a meme template.
    pub fn add_meme_template(&self, template: MemeTemplate) {
        self.templates
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(template);
    }

    /// Makes every read fail with `DataSourceUnavailable` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes paging fail once `pages` more pages have been served.
    ///
    /// `None` disables the injection.
    pub fn fail_after_pages(&self, pages: Option<usize>) {
        *lock(&self.fail_after_pages) = pages;
        self.pages_served.store(0, Ordering::SeqCst);
    }

    fn check_available(&self, operation: &str) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::data_source(operation, "store marked unavailable"));
        }
        Ok(())
    }

    fn check_page_budget(&self, operation: &str) -> Result<()> {
        self.check_available(operation)?;
        let served = self.pages_served.fetch_add(1, Ordering::SeqCst);
        match *lock(&self.fail_after_pages) {
            Some(limit) if served >= limit => {
                Err(Error::data_source(operation, "connection lost mid-scan"))
            },
            _ => Ok(()),
        }
    }

    fn read_posts(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<RowId, Post>> {
        self.posts
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn page_from<'a>(posts: impl Iterator<Item = &'a Post>, limit: usize) -> HashPage {
        HashPage::from_rows(
            posts
                .filter_map(|post| post.image_hash.clone().map(|hash| (post.row_id, hash)))
                .take(limit)
                .collect(),
        )
    }
}

impl HashStore for MemoryHashStore {
    fn page_hashes(&self, offset: usize, limit: usize) -> Result<HashPage> {
        self.check_page_budget("page_hashes")?;
        let posts = self.read_posts();
        Ok(Self::page_from(
            posts.values().filter(|p| p.image_hash.is_some()).skip(offset),
            limit,
        ))
    }

    fn page_hashes_after(&self, after: Option<RowId>, limit: usize) -> Result<HashPage> {
        self.check_page_budget("page_hashes_after")?;
        let posts = self.read_posts();
        let lower = after.map_or(Bound::Unbounded, Bound::Excluded);
        Ok(Self::page_from(
            posts.range((lower, Bound::Unbounded)).map(|(_, p)| p),
            limit,
        ))
    }

    fn count_hashes(&self) -> Result<usize> {
        self.check_available("count_hashes")?;
        Ok(self
            .read_posts()
            .values()
            .filter(|p| p.image_hash.is_some())
            .count())
    }

    fn get_post(&self, row_id: RowId) -> Result<Option<Post>> {
        self.check_available("get_post")?;
        Ok(self.read_posts().get(&row_id).cloned())
    }

    fn get_post_by_post_id(&self, post_id: &PostId) -> Result<Option<Post>> {
        self.check_available("get_post_by_post_id")?;
        Ok(self
            .read_posts()
            .values()
            .find(|p| &p.post_id == post_id)
            .cloned())
    }

    fn update_hash(&self, row_id: RowId, hash: &ImageHash) -> Result<()> {
        self.check_available("update_hash")?;
        let mut posts = self
            .posts
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let post = posts
            .get_mut(&row_id)
            .ok_or_else(|| Error::InvalidInput(format!("no post with row id {row_id}")))?;
        post.image_hash = Some(hash.clone());
        Ok(())
    }

    fn meme_templates(&self) -> Result<Vec<MemeTemplate>> {
        self.check_available("meme_templates")?;
        Ok(self
            .templates
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone())
    }
}

/// In-memory [`LockService`], shared by cloning an `Arc` to it.
#[derive(Default)]
pub struct MemoryLockService {
    locks: Mutex<HashMap<String, LockToken>>,
}

impl MemoryLockService {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockService for MemoryLockService {
    fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> Result<Option<LockToken>> {
        let mut locks = lock(&self.locks);
        let now = now_ms();
        if locks.get(name).is_some_and(|held| held.expires_at_ms > now) {
            return Ok(None);
        }
        let token = LockToken::new(name, holder, ttl);
        locks.insert(name.to_string(), token.clone());
        Ok(Some(token))
    }

    fn release(&self, token: &LockToken) -> Result<bool> {
        let mut locks = lock(&self.locks);
        if locks.get(&token.name).is_some_and(|held| held.token == token.token) {
            locks.remove(&token.name);
            return Ok(true);
        }
        Ok(false)
    }

    fn holder(&self, name: &str) -> Result<Option<String>> {
        let now = now_ms();
        Ok(lock(&self.locks)
            .get(name)
            .filter(|held| held.expires_at_ms > now)
            .map(|held| held.holder.clone()))
    }
}

/// In-memory [`BuildLog`].
#[derive(Default)]
pub struct MemoryBuildLog {
    records: Mutex<Vec<BuildRecord>>,
}

impl MemoryBuildLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record written so far, oldest first.
    #[must_use]
    pub fn records(&self) -> Vec<BuildRecord> {
        lock(&self.records).clone()
    }
}

impl BuildLog for MemoryBuildLog {
    fn record_build(&self, record: &BuildRecord) -> Result<()> {
        lock(&self.records).push(record.clone());
        Ok(())
    }

    fn last_build(&self, index_type: &str) -> Result<Option<BuildRecord>> {
        Ok(lock(&self.records)
            .iter()
            .rev()
            .find(|r| r.index_type == index_type)
            .cloned())
    }
}
