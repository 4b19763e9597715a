//! Index generation and build audit types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Immutable description of one built index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexGeneration {
    /// Number of vector components (hash bits).
    pub dimension: usize,
    /// Number of trees in the forest.
    pub tree_count: usize,
    /// Number of indexed items.
    pub item_count: usize,
    /// When the build started (or the file's creation time for loaded files).
    pub build_start: DateTime<Utc>,
    /// When the build finished (or the file's creation time for loaded files).
    pub build_end: DateTime<Utc>,
    /// Backing file.
    pub path: PathBuf,
}

/// Lifecycle state of the per-process active index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexState {
    /// Nothing loaded yet.
    NoIndex,
    /// Reading a persisted index.
    Loading,
    /// Active index is within its keep-alive window.
    Fresh,
    /// Active index (if any) is past its keep-alive window.
    Stale,
    /// This process holds the rebuild lock and is building.
    Rebuilding,
}

impl IndexState {
    /// Returns the state name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoIndex => "no_index",
            Self::Loading => "loading",
            Self::Fresh => "fresh",
            Self::Stale => "stale",
            Self::Rebuilding => "rebuilding",
        }
    }
}

impl fmt::Display for IndexState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit record written after each successful rebuild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecord {
    /// Kind of index that was built (e.g. `"image"`).
    pub index_type: String,
    /// Machine that built it.
    pub hostname: String,
    /// Number of indexed items.
    pub item_count: usize,
    /// Build start.
    pub build_start: DateTime<Utc>,
    /// Build end.
    pub build_end: DateTime<Utc>,
}

impl BuildRecord {
    /// Build duration in whole seconds.
    #[must_use]
    pub fn duration_secs(&self) -> i64 {
        (self.build_end - self.build_start).num_seconds()
    }
}
