//! Candidate, match and check result types.

use super::{IndexGeneration, Post, PostId, RowId};
use serde::{Deserialize, Serialize};

/// Raw neighbour returned by an index query.
///
/// Only the row id and the index-native distance are known at this point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Row id of the neighbour.
    pub row_id: RowId,
    /// Index-native (approximate) distance.
    pub distance: f32,
}

impl Candidate {
    /// Creates a candidate.
    #[must_use]
    pub const fn new(row_id: RowId, distance: f32) -> Self {
        Self { row_id, distance }
    }
}

/// A candidate that survived enrichment and exact re-scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    /// Post that was checked.
    pub original_post_id: PostId,
    /// Post that matched.
    pub matched_post_id: PostId,
    /// Index-native distance from the query.
    pub approximate_distance: f32,
    /// Exact Hamming distance between the two perceptual hashes.
    pub hamming_distance: u32,
    /// Fraction of matching bits, `0.0..=1.0`.
    pub match_percent: f64,
    /// The matched post.
    pub post: Post,
}

impl Match {
    /// Row id of the matched post.
    #[must_use]
    pub const fn row_id(&self) -> RowId {
        self.post.row_id
    }
}

/// Per-stage rejection counts from one filter pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterStats {
    /// Candidates handed to the pipeline.
    pub received: usize,
    /// Dropped by the approximate distance ceiling.
    pub over_distance_ceiling: usize,
    /// Dropped because the candidate was the query itself.
    pub self_match: usize,
    /// Dropped because the post (or its hash) could not be loaded.
    pub missing_post: usize,
    /// Dropped by the exact Hamming cutoff.
    pub over_hamming_cutoff: usize,
    /// Dropped because the author matched the query's author.
    pub same_author: usize,
    /// Dropped because the candidate is a crosspost.
    pub crosspost: usize,
    /// Dropped because the candidate is newer than the query.
    pub newer: usize,
    /// Dropped because the candidate is in a banned subreddit.
    pub banned_subreddit: usize,
    /// Dropped by subreddit scoping or the age window.
    pub out_of_scope: usize,
    /// Matches returned.
    pub kept: usize,
}

/// Outcome of a single repost check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepostResult {
    /// Post that was checked.
    pub checked_post_id: PostId,
    /// Whether at least one qualifying earlier match exists.
    pub is_repost: bool,
    /// Filtered matches; the first one is treated as the original.
    pub matches: Vec<Match>,
    /// Number of items in the index generation that answered the query.
    pub total_indexed: usize,
    /// Wall-clock time spent in the index query and filter, milliseconds.
    pub search_duration_ms: f64,
    /// Match percent of the closest surviving match.
    pub closest_match_percent: Option<f64>,
    /// Generation that answered the query.
    pub generation: Option<IndexGeneration>,
    /// Filter rejection counts.
    pub filter_stats: FilterStats,
}

impl RepostResult {
    /// Returns the match treated as the original post, if any.
    #[must_use]
    pub fn original(&self) -> Option<&Match> {
        self.matches.first()
    }
}
