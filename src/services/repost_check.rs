//! Repost check service.
//!
//! Answers "is this image post a repost, and of what?" by chaining the
//! hasher, the index lifecycle manager and the match filter pipeline.

use super::index_manager::IndexLifecycleManager;
use super::match_filter::{MatchFilterConfig, MatchFilterPipeline};
use crate::config::RepostConfig;
use crate::hashing::{ImageHash, PerceptualHasher};
use crate::models::{Post, PostId, PostType, RepostResult};
use crate::storage::{
    HashStore, LockService, RedisLockService, ResilientHashStore, SqliteHashStore,
    SqliteLockService, StoreResilienceConfig,
};
use crate::{Error, Result};
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Supplies the image bytes behind a post.
///
/// Only consulted when neither the post nor the store has a hash yet.
pub trait ImageFetcher: Send + Sync {
    /// Fetches the raw (encoded) image for `post`.
    ///
    /// # Errors
    ///
    /// Returns an error if the image cannot be retrieved.
    fn fetch(&self, post: &Post) -> Result<Vec<u8>>;
}

/// Reads images from the local filesystem.
///
/// The post URL is a path, optionally prefixed with `file://`. Relative
/// paths resolve against the configured root.
#[derive(Debug, Clone, Default)]
pub struct FsImageFetcher {
    root: Option<PathBuf>,
}

impl FsImageFetcher {
    /// Creates a fetcher resolving relative paths against the working directory.
    #[must_use]
    pub const fn new() -> Self {
        Self { root: None }
    }

    /// Resolves relative paths against `root`.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, url: &str) -> Result<PathBuf> {
        if url.contains("://") && !url.starts_with("file://") {
            return Err(Error::InvalidInput(format!(
                "filesystem fetcher cannot read remote url '{url}'"
            )));
        }
        let path = Path::new(url.strip_prefix("file://").unwrap_or(url));
        Ok(match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        })
    }
}

impl ImageFetcher for FsImageFetcher {
    fn fetch(&self, post: &Post) -> Result<Vec<u8>> {
        if post.url.is_empty() {
            return Err(Error::InvalidInput(format!(
                "post {} has no url to fetch",
                post.post_id
            )));
        }
        let path = self.resolve(&post.url)?;
        std::fs::read(&path)
            .map_err(|e| Error::operation("fetch_image", format!("{}: {e}", path.display())))
    }
}

/// Decides whether image posts are reposts.
pub struct RepostCheckService {
    hasher: PerceptualHasher,
    store: Arc<dyn HashStore>,
    index: Arc<IndexLifecycleManager>,
    filter: MatchFilterPipeline,
    fetcher: Option<Arc<dyn ImageFetcher>>,
    neighbors: usize,
    search_budget: usize,
}

impl RepostCheckService {
    /// Creates a service from its collaborators.
    #[must_use]
    pub fn new(
        hasher: PerceptualHasher,
        store: Arc<dyn HashStore>,
        index: Arc<IndexLifecycleManager>,
        filter_config: MatchFilterConfig,
    ) -> Self {
        Self {
            hasher,
            filter: MatchFilterPipeline::new(Arc::clone(&store), filter_config),
            store,
            index,
            fetcher: None,
            neighbors: 50,
            search_budget: 0,
        }
    }

    /// Wires the service from configuration: `SQLite` hash store behind a
    /// circuit breaker, Redis or `SQLite` rebuild lock, `SQLite` build log.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a backend cannot
    /// be opened.
    pub fn from_config(config: &RepostConfig) -> Result<Self> {
        config.validate()?;
        let db_path = config.database_path();

        let store: Arc<dyn HashStore> = Arc::new(ResilientHashStore::new(
            SqliteHashStore::new(&db_path)?,
            StoreResilienceConfig::from_env(),
            "sqlite",
        ));
        let locks: Arc<dyn LockService> = match &config.redis_url {
            Some(url) => Arc::new(RedisLockService::new(url, "repostscan")?),
            None => Arc::new(SqliteLockService::new(&db_path)?),
        };
        let build_log = Arc::new(SqliteHashStore::new(&db_path)?);

        let manager = IndexLifecycleManager::from_config(config, Arc::clone(&store), locks)
            .with_build_log(build_log);

        Ok(Self::new(
            PerceptualHasher::new(config.hash_size),
            store,
            Arc::new(manager),
            MatchFilterConfig::from_config(config),
        )
        .with_query_params(config.query_neighbors, config.search_budget))
    }

    /// Sets the fetcher used for posts without a hash.
    #[must_use]
    pub fn with_fetcher(mut self, fetcher: Arc<dyn ImageFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Sets `k` and the search budget (0 = trees * k).
    #[must_use]
    pub fn with_query_params(mut self, neighbors: usize, search_budget: usize) -> Self {
        self.neighbors = neighbors.max(1);
        self.search_budget = search_budget;
        self
    }

    /// The lifecycle manager answering queries.
    #[must_use]
    pub fn index_manager(&self) -> &Arc<IndexLifecycleManager> {
        &self.index
    }

    /// The hash store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn HashStore> {
        &self.store
    }

    /// Checks one image post.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`] for non-image posts or a post with neither
    ///   hash nor fetchable image
    /// - [`Error::ImageConversion`] if the fetched image cannot be decoded
    /// - [`Error::NoIndexAvailable`] if no index can be served yet
    /// - [`Error::DataSourceUnavailable`] if matches cannot be enriched
    #[instrument(skip(self, post), fields(post_id = %post.post_id))]
    pub fn check_post(&self, post: &Post) -> Result<RepostResult> {
        if post.post_type != PostType::Image {
            return Err(Error::InvalidInput(format!(
                "post {} is a {} post, image matching does not apply",
                post.post_id, post.post_type
            )));
        }
        let post = self.ensure_hash(post)?;
        let Some(hash) = post.image_hash.as_ref() else {
            return Err(Error::InvalidInput(format!(
                "post {} has no image hash",
                post.post_id
            )));
        };

        let active = self.index.ensure_fresh()?;
        let start = Instant::now();
        let candidates = active
            .index()
            .query_hash(hash, self.neighbors, self.search_budget)?;
        let outcome = self.filter.filter_with_stats(&candidates, &post)?;
        let search_duration_ms = start.elapsed().as_secs_f64() * 1000.0;

        let is_repost = !outcome.matches.is_empty();
        metrics::counter!(
            "repostscan_checks_total",
            "verdict" => if is_repost { "repost" } else { "original" }
        )
        .increment(1);
        metrics::histogram!("repostscan_check_search_duration_ms").record(search_duration_ms);
        info!(
            is_repost,
            matches = outcome.matches.len(),
            candidates = candidates.len(),
            search_duration_ms,
            "repost check complete"
        );

        Ok(RepostResult {
            checked_post_id: post.post_id.clone(),
            is_repost,
            closest_match_percent: outcome
                .matches
                .iter()
                .map(|m| m.match_percent)
                .reduce(f64::max),
            matches: outcome.matches,
            total_indexed: active.index().item_count(),
            search_duration_ms,
            generation: Some(active.generation().clone()),
            filter_stats: outcome.stats,
        })
    }

    /// Checks several posts; each result is independent of the others.
    pub fn check_posts(&self, posts: &[Post]) -> Vec<(PostId, Result<RepostResult>)> {
        posts
            .iter()
            .map(|post| {
                let result = self.check_post(post);
                if let Err(e) = &result {
                    warn!(post_id = %post.post_id, error = %e, "repost check failed");
                }
                (post.post_id.clone(), result)
            })
            .collect()
    }

    /// Looks up a stored post by id and checks it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the post is unknown, otherwise see
    /// [`Self::check_post`].
    pub fn check_post_id(&self, post_id: &PostId) -> Result<RepostResult> {
        let post = self
            .store
            .get_post_by_post_id(post_id)?
            .ok_or_else(|| Error::InvalidInput(format!("unknown post {post_id}")))?;
        self.check_post(&post)
    }

    /// Returns `post` with a hash, computing and storing one if needed.
    fn ensure_hash<'a>(&self, post: &'a Post) -> Result<Cow<'a, Post>> {
        if post.image_hash.is_some() {
            return Ok(Cow::Borrowed(post));
        }
        if let Some(hash) = self.store.get_hash_by_post_id(&post.post_id)? {
            return Ok(Cow::Owned(post.clone().with_hash(hash)));
        }

        let fetcher = self.fetcher.as_ref().ok_or_else(|| {
            Error::InvalidInput(format!(
                "post {} has no hash and no image fetcher is configured",
                post.post_id
            ))
        })?;
        let bytes = fetcher.fetch(post)?;
        let hash: ImageHash = self.hasher.hash_bytes(&bytes)?;
        debug!(bits_set = hash.count_ones(), "computed missing hash");

        if post.row_id != 0
            && let Err(e) = self.store.update_hash(post.row_id, &hash)
        {
            warn!(error = %e, "failed to store computed hash");
        }
        Ok(Cow::Owned(post.clone().with_hash(hash)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::RetryPolicy;
    use crate::services::index_manager::IndexManagerSettings;
    use crate::storage::{MemoryHashStore, MemoryLockService};
    use image::{ImageBuffer, Luma};
    use std::io::Cursor;
    use std::time::Duration;
    use tempfile::TempDir;

    fn service(dir: &TempDir, store: Arc<MemoryHashStore>) -> RepostCheckService {
        let settings = IndexManagerSettings {
            dimension: 256,
            tree_count: 4,
            leaf_size: 8,
            keep_alive: Duration::from_secs(3600),
            lock_ttl: Duration::from_secs(60),
            page_size: 100,
            jitter: Duration::ZERO,
            refresh_cooldown: Duration::ZERO,
            index_path: dir.path().join("index.rpx"),
            machine_id: "unit".to_string(),
            seed: Some(1),
        };
        let manager = IndexLifecycleManager::new(
            settings,
            store.clone(),
            Arc::new(MemoryLockService::new()),
            RetryPolicy::no_retry(),
        );
        RepostCheckService::new(
            PerceptualHasher::default(),
            store,
            Arc::new(manager),
            MatchFilterConfig::default(),
        )
    }

    fn png_gradient() -> Vec<u8> {
        let img = ImageBuffer::from_fn(64, 64, |x, _| {
            Luma([u8::try_from(x * 3).unwrap_or(u8::MAX)])
        });
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_non_image_post_rejected() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, Arc::new(MemoryHashStore::new()));
        let post = Post::new(0, "l", "a", 0).with_post_type(PostType::Link);
        assert!(matches!(
            service.check_post(&post),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_missing_hash_without_fetcher_rejected() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, Arc::new(MemoryHashStore::new()));
        let err = service.check_post(&Post::new(0, "x", "a", 0)).unwrap_err();
        assert!(err.to_string().contains("no image fetcher"));
    }

    #[test]
    fn test_hash_computed_and_persisted() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("img.png"), png_gradient()).unwrap();
        let store = Arc::new(MemoryHashStore::new());
        let row_id = store.insert_post(Post::new(0, "fresh", "a", 10).with_url("img.png"));
        let service = service(&dir, store.clone())
            .with_fetcher(Arc::new(FsImageFetcher::with_root(dir.path())));

        let post = store.get_post(row_id).unwrap().unwrap();
        let result = service.check_post(&post).unwrap();
        assert!(!result.is_repost);
        assert!(store.get_post(row_id).unwrap().unwrap().image_hash.is_some());
    }

    #[test]
    fn test_fetcher_rejects_remote_urls() {
        let fetcher = FsImageFetcher::new();
        let post = Post::new(0, "r", "a", 0).with_url("https://i.redd.it/x.jpg");
        assert!(matches!(fetcher.fetch(&post), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_batch_isolates_failures() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, Arc::new(MemoryHashStore::new()));
        let good = Post::new(0, "good", "a", 0).with_hash(ImageHash::from_bytes(vec![0; 32]));
        let bad = Post::new(0, "bad", "a", 0).with_post_type(PostType::Text);

        let results = service.check_posts(&[bad, good]);
        assert!(results[0].1.is_err());
        assert!(!results[1].1.as_ref().unwrap().is_repost);
    }
}
