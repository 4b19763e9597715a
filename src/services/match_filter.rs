//! Match filter pipeline.
//!
//! Turns raw index neighbours into qualifying matches. Stages run in a
//! fixed order so that cheap checks reject index noise before any database
//! lookup happens:
//!
//! 1. **Distance ceiling**: drop candidates whose approximate distance is too large
//! 2. **Self match**: drop the checked post itself
//! 3. **Enrichment**: load the candidate posts in one batch
//! 4. **Exact re-scoring**: Hamming distance against the checked hash, inclusive cutoff
//! 5. **Policy**: same author, crossposts, newer posts, banned subreddits, scope
//! 6. **Ordering**: oldest first (row id breaks ties), or by match percent
//!
//! A candidate whose post cannot be found is dropped on its own; it never
//! fails the pass. An unreachable store does fail the pass, since an empty
//! list would read as "original content".

use crate::config::{FilterSettings, MatchOrdering, RepostConfig};
use crate::hashing::ImageHash;
use crate::index::distance_for_hamming;
use crate::models::{Candidate, FilterStats, Match, MemeTemplate, Post};
use crate::storage::HashStore;
use crate::{Error, Result};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

const SECONDS_PER_DAY: i64 = 86_400;

/// Thresholds and policy toggles for one pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchFilterConfig {
    /// Maximum approximate (index-native) distance, inclusive.
    pub distance_ceiling: f32,
    /// Maximum Hamming distance, inclusive.
    pub hamming_cutoff: u32,
    /// Drop candidates by the checked post's author.
    pub exclude_same_author: bool,
    /// Keep candidates that are crossposts.
    pub include_crossposts: bool,
    /// Drop candidates created after the checked post.
    pub only_older: bool,
    /// Subreddits whose posts never match (case-insensitive).
    pub banned_subreddits: Vec<String>,
    /// Keep only candidates from the checked post's subreddit.
    pub same_subreddit_only: bool,
    /// Drop candidates more than this many days older than the checked post.
    pub max_age_days: Option<u32>,
    /// Result ordering.
    pub ordering: MatchOrdering,
    /// Apply meme-template suppression.
    pub meme_filter: bool,
    /// Cutoff used when the checked image is a meme template instance.
    pub meme_hamming_cutoff: u32,
}

impl Default for MatchFilterConfig {
    fn default() -> Self {
        Self::from_settings(4.0, 10, &FilterSettings::default())
    }
}

impl MatchFilterConfig {
    /// Builds the filter configuration from the crate configuration.
    #[must_use]
    pub fn from_config(config: &RepostConfig) -> Self {
        Self::from_settings(
            config.annoy_distance_ceiling,
            config.hamming_cutoff,
            &config.filter,
        )
    }

    fn from_settings(distance_ceiling: f32, hamming_cutoff: u32, filter: &FilterSettings) -> Self {
        Self {
            distance_ceiling,
            hamming_cutoff,
            exclude_same_author: filter.exclude_same_author,
            include_crossposts: filter.include_crossposts,
            only_older: filter.only_older,
            banned_subreddits: filter
                .banned_subreddits
                .iter()
                .map(|s| s.to_lowercase())
                .collect(),
            same_subreddit_only: filter.same_subreddit_only,
            max_age_days: filter.max_age_days,
            ordering: filter.ordering,
            meme_filter: filter.meme_filter,
            meme_hamming_cutoff: filter.meme_hamming_cutoff,
        }
    }

    /// Sets the Hamming cutoff, raising the distance ceiling if it would
    /// reject candidates inside the new cutoff.
    #[must_use]
    pub fn with_hamming_cutoff(mut self, cutoff: u32) -> Self {
        self.hamming_cutoff = cutoff;
        self.distance_ceiling = self.distance_ceiling.max(distance_for_hamming(cutoff));
        self
    }

    /// Sets the approximate distance ceiling.
    #[must_use]
    pub const fn with_distance_ceiling(mut self, ceiling: f32) -> Self {
        self.distance_ceiling = ceiling;
        self
    }

    /// Sets the ordering.
    #[must_use]
    pub const fn with_ordering(mut self, ordering: MatchOrdering) -> Self {
        self.ordering = ordering;
        self
    }

    /// Checks that the ceiling admits every candidate within the cutoff.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] when the ceiling is not a number or is
    /// below the approximate distance of `hamming_cutoff`.
    pub fn validate(&self) -> Result<()> {
        let required = distance_for_hamming(self.hamming_cutoff);
        if self.distance_ceiling.is_nan() || self.distance_ceiling < required {
            return Err(Error::InvalidInput(format!(
                "distance ceiling {} is below sqrt({}) = {required:.3}; \
                 candidates inside the Hamming cutoff would be dropped",
                self.distance_ceiling, self.hamming_cutoff
            )));
        }
        Ok(())
    }

    fn is_banned(&self, subreddit: &str) -> bool {
        !subreddit.is_empty()
            && self
                .banned_subreddits
                .iter()
                .any(|banned| banned.eq_ignore_ascii_case(subreddit))
    }
}

/// Output of one filter pass.
#[derive(Debug, Clone, Default)]
pub struct FilterOutcome {
    /// Qualifying matches in result order.
    pub matches: Vec<Match>,
    /// Rejection counts per stage.
    pub stats: FilterStats,
    /// Meme template the checked image was recognised as, if any.
    pub meme_template: Option<String>,
}

/// Applies match policy to raw index candidates.
pub struct MatchFilterPipeline {
    store: Arc<dyn HashStore>,
    config: MatchFilterConfig,
}

impl MatchFilterPipeline {
    /// Creates a pipeline reading posts from `store`.
    #[must_use]
    pub fn new(store: Arc<dyn HashStore>, config: MatchFilterConfig) -> Self {
        Self { store, config }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &MatchFilterConfig {
        &self.config
    }

    /// Filters `candidates` for `query` and returns the surviving matches.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if `query` has no hash, or
    /// [`Error::DataSourceUnavailable`] if candidate posts cannot be loaded.
    pub fn filter(&self, candidates: &[Candidate], query: &Post) -> Result<Vec<Match>> {
        self.filter_with_stats(candidates, query)
            .map(|outcome| outcome.matches)
    }

    /// Like [`Self::filter`], also returning per-stage rejection counts.
    ///
    /// # Errors
    ///
    /// See [`Self::filter`].
    #[instrument(
        skip(self, candidates, query),
        fields(post_id = %query.post_id, candidates = candidates.len())
    )]
    pub fn filter_with_stats(&self, candidates: &[Candidate], query: &Post) -> Result<FilterOutcome> {
        let query_hash = query.image_hash.as_ref().ok_or_else(|| {
            Error::InvalidInput(format!("post {} has no image hash", query.post_id))
        })?;
        let mut stats = FilterStats {
            received: candidates.len(),
            ..FilterStats::default()
        };

        let mut survivors: Vec<Candidate> = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if candidate.distance > self.config.distance_ceiling || candidate.distance.is_nan() {
                stats.over_distance_ceiling += 1;
            } else if query.row_id != 0 && candidate.row_id == query.row_id {
                stats.self_match += 1;
            } else {
                survivors.push(*candidate);
            }
        }

        let (cutoff, meme_template) = self.effective_cutoff(query_hash);
        let posts = self.load_posts(&survivors)?;

        let mut matches = Vec::with_capacity(survivors.len());
        for (candidate, post) in survivors.into_iter().zip(posts) {
            let Some(post) = post else {
                stats.missing_post += 1;
                continue;
            };
            if post.post_id == query.post_id {
                stats.self_match += 1;
                continue;
            }
            let Some(hamming) = post
                .image_hash
                .as_ref()
                .and_then(|hash| query_hash.hamming_distance(hash).ok())
            else {
                stats.missing_post += 1;
                continue;
            };
            if hamming > cutoff {
                stats.over_hamming_cutoff += 1;
                continue;
            }
            if let Some(counter) = self.policy_rejection(&post, query, &mut stats) {
                *counter += 1;
                continue;
            }

            matches.push(Match {
                original_post_id: query.post_id.clone(),
                matched_post_id: post.post_id.clone(),
                approximate_distance: candidate.distance,
                hamming_distance: hamming,
                match_percent: query_hash.match_percent(hamming),
                post,
            });
        }

        self.sort(&mut matches);
        stats.kept = matches.len();
        record_stats(&stats);
        debug!(
            kept = stats.kept,
            cutoff,
            meme = meme_template.as_deref().unwrap_or(""),
            "filtered candidates"
        );

        Ok(FilterOutcome {
            matches,
            stats,
            meme_template,
        })
    }

    /// Cutoff for this query, tightened when the image is a meme template.
    fn effective_cutoff(&self, query_hash: &ImageHash) -> (u32, Option<String>) {
        if !self.config.meme_filter {
            return (self.config.hamming_cutoff, None);
        }
        let templates = match self.store.meme_templates() {
            Ok(templates) => templates,
            Err(e) => {
                warn!(error = %e, "meme templates unavailable, using general cutoff");
                return (self.config.hamming_cutoff, None);
            },
        };
        templates
            .iter()
            .filter(|template| template.covers(query_hash))
            .min_by_key(|template| template_cutoff(template, self.config.meme_hamming_cutoff))
            .map_or((self.config.hamming_cutoff, None), |template| {
                let cutoff = template_cutoff(template, self.config.meme_hamming_cutoff)
                    .min(self.config.hamming_cutoff);
                (cutoff, Some(template.name.clone()))
            })
    }

    /// Loads candidate posts in input order.
    ///
    /// Falls back to single lookups when the batch fails; a single lookup
    /// that fails for a non-transient reason only drops its candidate.
    fn load_posts(&self, candidates: &[Candidate]) -> Result<Vec<Option<Post>>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let row_ids: Vec<_> = candidates.iter().map(|c| c.row_id).collect();
        match self.store.get_posts(&row_ids) {
            Ok(posts) if posts.len() == row_ids.len() => return Ok(posts),
            Ok(posts) => warn!(
                expected = row_ids.len(),
                actual = posts.len(),
                "batch lookup returned wrong length, retrying individually"
            ),
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => warn!(error = %e, "batch lookup failed, retrying individually"),
        }

        row_ids
            .iter()
            .map(|&row_id| match self.store.get_post(row_id) {
                Ok(post) => Ok(post),
                Err(e) if e.is_retryable() => Err(e),
                Err(e) => {
                    debug!(row_id, error = %e, "dropping candidate after failed lookup");
                    Ok(None)
                },
            })
            .collect()
    }

    /// Returns the counter for the first policy that rejects `post`.
    fn policy_rejection<'a>(
        &self,
        post: &Post,
        query: &Post,
        stats: &'a mut FilterStats,
    ) -> Option<&'a mut usize> {
        let config = &self.config;
        if config.exclude_same_author && post.author.eq_ignore_ascii_case(&query.author) {
            return Some(&mut stats.same_author);
        }
        if !config.include_crossposts && post.is_crosspost() {
            return Some(&mut stats.crosspost);
        }
        if config.only_older && post.created_at > query.created_at {
            return Some(&mut stats.newer);
        }
        if config.is_banned(&post.subreddit) {
            return Some(&mut stats.banned_subreddit);
        }
        if config.same_subreddit_only && !post.subreddit.eq_ignore_ascii_case(&query.subreddit) {
            return Some(&mut stats.out_of_scope);
        }
        if let Some(days) = config.max_age_days {
            let window = i64::from(days) * SECONDS_PER_DAY;
            if query.created_at.saturating_sub(post.created_at) > window {
                return Some(&mut stats.out_of_scope);
            }
        }
        None
    }

    fn sort(&self, matches: &mut [Match]) {
        let oldest = |a: &Match, b: &Match| {
            a.post
                .created_at
                .cmp(&b.post.created_at)
                .then_with(|| a.row_id().cmp(&b.row_id()))
        };
        match self.config.ordering {
            MatchOrdering::Oldest => matches.sort_by(oldest),
            MatchOrdering::MatchPercent => matches.sort_by(|a, b| {
                b.match_percent
                    .partial_cmp(&a.match_percent)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| oldest(a, b))
            }),
        }
    }
}

fn template_cutoff(template: &MemeTemplate, default_cutoff: u32) -> u32 {
    template.match_cutoff.unwrap_or(default_cutoff)
}

fn record_stats(stats: &FilterStats) {
    let stages = [
        ("distance_ceiling", stats.over_distance_ceiling),
        ("self_match", stats.self_match),
        ("missing_post", stats.missing_post),
        ("hamming_cutoff", stats.over_hamming_cutoff),
        ("same_author", stats.same_author),
        ("crosspost", stats.crosspost),
        ("newer", stats.newer),
        ("banned_subreddit", stats.banned_subreddit),
        ("out_of_scope", stats.out_of_scope),
    ];
    for (stage, count) in stages {
        if count > 0 {
            metrics::counter!("repostscan_filter_rejections_total", "stage" => stage)
                .increment(u64::try_from(count).unwrap_or(u64::MAX));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PostId, RowId};
    use crate::storage::MemoryHashStore;
    use crate::storage::traits::HashPage;

    /// 32-byte hash with the first `flipped` bits set.
    fn hash_with_bits(flipped: u32) -> ImageHash {
        let mut bytes = vec![0u8; 32];
        for bit in 0..flipped as usize {
            bytes[bit / 8] |= 0x80 >> (bit % 8);
        }
        ImageHash::from_bytes(bytes)
    }

    fn query() -> Post {
        Post::new(1, "q", "alice", 1_000)
            .with_subreddit("pics")
            .with_hash(hash_with_bits(0))
    }

    fn pipeline_with(posts: Vec<Post>, config: MatchFilterConfig) -> MatchFilterPipeline {
        let store = MemoryHashStore::new();
        for post in posts {
            store.insert_post(post);
        }
        MatchFilterPipeline::new(Arc::new(store), config)
    }

    fn candidates(ids: &[RowId]) -> Vec<Candidate> {
        ids.iter().map(|&id| Candidate::new(id, 1.0)).collect()
    }

    fn ids(matches: &[Match]) -> Vec<&str> {
        matches.iter().map(|m| m.matched_post_id.as_str()).collect()
    }

    #[test]
    fn test_hamming_cutoff_is_inclusive() {
        let pipeline = pipeline_with(
            vec![
                query(),
                Post::new(2, "at", "bob", 10).with_hash(hash_with_bits(10)),
                Post::new(3, "over", "bob", 10).with_hash(hash_with_bits(11)),
            ],
            MatchFilterConfig::default(),
        );
        let outcome = pipeline
            .filter_with_stats(&candidates(&[2, 3]), &query())
            .unwrap();
        assert_eq!(ids(&outcome.matches), vec!["at"]);
        assert_eq!(outcome.stats.over_hamming_cutoff, 1);
        assert_eq!(outcome.matches[0].hamming_distance, 10);
    }

    #[test]
    fn test_distance_ceiling_runs_before_lookup() {
        let pipeline = pipeline_with(vec![], MatchFilterConfig::default());
        let outcome = pipeline
            .filter_with_stats(&[Candidate::new(2, 4.5)], &query())
            .unwrap();
        assert_eq!(outcome.stats.over_distance_ceiling, 1);
        assert_eq!(outcome.stats.missing_post, 0);
    }

    #[test]
    fn test_self_match_and_missing_posts_dropped() {
        let pipeline = pipeline_with(vec![query()], MatchFilterConfig::default());
        let outcome = pipeline
            .filter_with_stats(&candidates(&[1, 77]), &query())
            .unwrap();
        assert!(outcome.matches.is_empty());
        assert_eq!(outcome.stats.self_match, 1);
        assert_eq!(outcome.stats.missing_post, 1);
    }

    #[test]
    fn test_policy_filters() {
        let hash = hash_with_bits(2);
        let config = MatchFilterConfig {
            banned_subreddits: vec!["spam".to_string()],
            ..MatchFilterConfig::default()
        };
        let pipeline = pipeline_with(
            vec![
                Post::new(2, "same-author", "ALICE", 10).with_hash(hash.clone()),
                Post::new(3, "crosspost", "bob", 10)
                    .with_hash(hash.clone())
                    .with_crosspost_parent("t3_x"),
                Post::new(4, "newer", "bob", 2_000).with_hash(hash.clone()),
                Post::new(5, "banned", "bob", 10)
                    .with_hash(hash.clone())
                    .with_subreddit("Spam"),
                Post::new(6, "kept", "bob", 10).with_hash(hash),
            ],
            config,
        );
        let outcome = pipeline
            .filter_with_stats(&candidates(&[2, 3, 4, 5, 6]), &query())
            .unwrap();
        assert_eq!(ids(&outcome.matches), vec!["kept"]);
        let stats = outcome.stats;
        assert_eq!(
            (stats.same_author, stats.crosspost, stats.newer, stats.banned_subreddit),
            (1, 1, 1, 1)
        );
        assert_eq!(stats.kept, 1);
    }

    #[test]
    fn test_scope_filters() {
        let hash = hash_with_bits(1);
        let config = MatchFilterConfig {
            same_subreddit_only: true,
            max_age_days: Some(1),
            ..MatchFilterConfig::default()
        };
        let pipeline = pipeline_with(
            vec![
                Post::new(2, "other-sub", "bob", 900)
                    .with_hash(hash.clone())
                    .with_subreddit("funny"),
                Post::new(3, "too-old", "bob", 1_000 - 2 * SECONDS_PER_DAY)
                    .with_hash(hash.clone())
                    .with_subreddit("pics"),
                Post::new(4, "in-scope", "bob", 900)
                    .with_hash(hash)
                    .with_subreddit("PICS"),
            ],
            config,
        );
        let outcome = pipeline
            .filter_with_stats(&candidates(&[2, 3, 4]), &query())
            .unwrap();
        assert_eq!(ids(&outcome.matches), vec!["in-scope"]);
        assert_eq!(outcome.stats.out_of_scope, 2);
    }

    #[test]
    fn test_oldest_first_with_row_id_tiebreak() {
        let hash = hash_with_bits(3);
        let pipeline = pipeline_with(
            vec![
                Post::new(5, "later-row", "bob", 50).with_hash(hash.clone()),
                Post::new(3, "earlier-row", "carol", 50).with_hash(hash.clone()),
                Post::new(4, "oldest", "dave", 20).with_hash(hash),
            ],
            MatchFilterConfig::default(),
        );
        let matches = pipeline.filter(&candidates(&[5, 3, 4]), &query()).unwrap();
        assert_eq!(ids(&matches), vec!["oldest", "earlier-row", "later-row"]);
    }

    #[test]
    fn test_match_percent_ordering() {
        let pipeline = pipeline_with(
            vec![
                Post::new(2, "old-far", "bob", 10).with_hash(hash_with_bits(8)),
                Post::new(3, "new-close", "bob", 500).with_hash(hash_with_bits(1)),
            ],
            MatchFilterConfig::default().with_ordering(MatchOrdering::MatchPercent),
        );
        let matches = pipeline.filter(&candidates(&[2, 3]), &query()).unwrap();
        assert_eq!(ids(&matches), vec!["new-close", "old-far"]);
        assert!((matches[0].match_percent - 255.0 / 256.0).abs() < 1e-9);
    }

    #[test]
    fn test_meme_template_tightens_cutoff() {
        let store = MemoryHashStore::new();
        store.insert_post(Post::new(2, "caption-a", "bob", 10).with_hash(hash_with_bits(6)));
        store.insert_post(Post::new(3, "same-image", "bob", 10).with_hash(hash_with_bits(2)));
        store.add_meme_template(MemeTemplate::new("drake", hash_with_bits(1), 8));
        let pipeline = MatchFilterPipeline::new(Arc::new(store), MatchFilterConfig::default());

        let outcome = pipeline
            .filter_with_stats(&candidates(&[2, 3]), &query())
            .unwrap();
        assert_eq!(ids(&outcome.matches), vec!["same-image"]);
        assert_eq!(outcome.meme_template.as_deref(), Some("drake"));
    }

    #[test]
    fn test_ceiling_must_cover_cutoff() {
        let mut config = MatchFilterConfig::default();
        assert!(config.validate().is_ok());

        config.hamming_cutoff = 20;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)), "got {err:?}");

        config.distance_ceiling = distance_for_hamming(20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_raised_cutoff_widens_ceiling() {
        let config = MatchFilterConfig::default().with_hamming_cutoff(20);
        assert!(config.validate().is_ok());
        assert!(config.distance_ceiling >= distance_for_hamming(20));

        let narrowed = MatchFilterConfig::default().with_hamming_cutoff(4);
        assert!((narrowed.distance_ceiling - 4.0).abs() < f32::EPSILON);

        let pipeline = pipeline_with(
            vec![Post::new(2, "far", "bob", 10).with_hash(hash_with_bits(18))],
            config,
        );
        let far = Candidate::new(2, distance_for_hamming(18));
        let outcome = pipeline.filter_with_stats(&[far], &query()).unwrap();
        assert_eq!(ids(&outcome.matches), vec!["far"]);
        assert_eq!(outcome.stats.over_distance_ceiling, 0);
    }

    #[test]
    fn test_query_without_hash_is_rejected() {
        let pipeline = pipeline_with(vec![], MatchFilterConfig::default());
        let err = pipeline
            .filter(&candidates(&[2]), &Post::new(1, "q", "a", 0))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_unreachable_store_fails_the_pass() {
        let store = Arc::new(MemoryHashStore::new());
        store.insert_post(Post::new(2, "m", "bob", 10).with_hash(hash_with_bits(1)));
        store.set_unavailable(true);
        let pipeline = MatchFilterPipeline::new(store, MatchFilterConfig::default());
        let err = pipeline.filter(&candidates(&[2]), &query()).unwrap_err();
        assert!(err.is_retryable());
    }

    /// Store whose batch lookup always fails with a permanent error.
    struct NoBatchStore(MemoryHashStore);

    impl HashStore for NoBatchStore {
        fn page_hashes(&self, offset: usize, limit: usize) -> Result<HashPage> {
            self.0.page_hashes(offset, limit)
        }
        fn page_hashes_after(&self, after: Option<RowId>, limit: usize) -> Result<HashPage> {
            self.0.page_hashes_after(after, limit)
        }
        fn count_hashes(&self) -> Result<usize> {
            self.0.count_hashes()
        }
        fn get_post(&self, row_id: RowId) -> Result<Option<Post>> {
            self.0.get_post(row_id)
        }
        fn get_posts(&self, _row_ids: &[RowId]) -> Result<Vec<Option<Post>>> {
            Err(Error::operation("get_posts", "statement too long"))
        }
        fn get_post_by_post_id(&self, post_id: &PostId) -> Result<Option<Post>> {
            self.0.get_post_by_post_id(post_id)
        }
        fn update_hash(&self, row_id: RowId, hash: &ImageHash) -> Result<()> {
            self.0.update_hash(row_id, hash)
        }
    }

    #[test]
    fn test_batch_failure_falls_back_to_single_lookups() {
        let inner = MemoryHashStore::new();
        inner.insert_post(Post::new(2, "m", "bob", 10).with_hash(hash_with_bits(1)));
        let pipeline =
            MatchFilterPipeline::new(Arc::new(NoBatchStore(inner)), MatchFilterConfig::default());
        let matches = pipeline.filter(&candidates(&[2, 9]), &query()).unwrap();
        assert_eq!(ids(&matches), vec!["m"]);
    }
}
