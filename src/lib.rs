//! # repostscan
//!
//! Near-duplicate image repost detection for a continuous stream of
//! submissions.
//!
//! repostscan keeps an approximate-nearest-neighbour index over perceptual
//! image hashes, refreshes it safely while many worker processes keep
//! querying, and applies match policy (author, crosspost, age and meme
//! template rules) to decide whether a submission is a repost and which
//! earlier post is the original.
//!
//! ## Components
//!
//! - [`hashing`]: 16x16 difference hash (dhash) of decoded images
//! - [`index`]: random-split forest over hash bit vectors
//! - [`storage`]: hash store, rebuild lock and build log backends
//! - [`services`]: index lifecycle, match filtering and the repost check
//!
//! ## Example
//!
//! ```rust,ignore
//! use repostscan::{RepostConfig, RepostCheckService};
//!
//! let config = RepostConfig::load_default();
//! let service = RepostCheckService::from_config(&config)?;
//! let result = service.check_post(&post)?;
//! if result.is_repost {
//!     println!("original: {}", result.matches[0].post.post_id);
//! }
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![allow(clippy::multiple_crate_versions)]

use thiserror::Error as ThisError;

// Module declarations
pub mod config;
pub mod hashing;
pub mod index;
pub mod models;
pub mod observability;
pub mod services;
pub mod storage;

// Re-exports for convenience
pub use config::{FilterSettings, RepostConfig};
pub use hashing::{ImageHash, PerceptualHasher};
pub use index::ApproximateIndex;
pub use models::{
    BuildRecord, Candidate, IndexGeneration, Match, Post, PostId, PostType, RepostResult, RowId,
};
pub use services::{
    IndexLifecycleManager, MatchFilterConfig, MatchFilterPipeline, RepostCheckService,
    RetryPolicy,
};
pub use storage::{BuildLog, HashStore, LockService};

/// Error type for repostscan operations.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `InvalidInput` | Bad configuration, wrong vector length, non-image post |
/// | `OperationFailed` | I/O errors, corrupt index files, backend failures |
/// | `ImageConversion` | Image bytes cannot be decoded or resized |
/// | `NoIndexAvailable` | No index could be loaded or built within the retry budget |
/// | `LockUnavailable` | Another process holds the rebuild lock |
/// | `FormatMismatch` | Persisted index dimension differs from the configured one |
/// | `DataSourceUnavailable` | The hash store cannot be reached |
/// | `FeatureNotEnabled` | A backend needs a Cargo feature that is not compiled in |
#[derive(Debug, ThisError)]
pub enum Error {
    /// Invalid input was provided.
    ///
    /// Raised when:
    /// - A configuration value fails validation
    /// - A vector does not match the index dimension
    /// - `add_item` is called after `build`, or `query` before it
    /// - A repost check is requested for a non-image post
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An operation failed.
    ///
    /// Raised when:
    /// - `SQLite` or Redis operations fail outside of a data-source read
    /// - Filesystem I/O errors occur while saving or loading the index
    /// - The index file is truncated or carries the wrong magic bytes
    #[error("operation '{operation}' failed: {cause}")]
    OperationFailed {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// The source image could not be decoded or resampled.
    ///
    /// No hash is produced and no index entry is added.
    #[error("image conversion failed: {0}")]
    ImageConversion(String),

    /// No index could be loaded or rebuilt within the staleness and
    /// lock-retry budget.
    ///
    /// Transient: callers should retry the check later.
    #[error("no index available: {0}")]
    NoIndexAvailable(String),

    /// The rebuild lock is held by another process.
    ///
    /// Internal signal; the lifecycle manager reacts by waiting or
    /// continuing with the stale index.
    #[error("rebuild lock '{name}' is held by another process")]
    LockUnavailable {
        /// Lock name.
        name: String,
    },

    /// The persisted index was built for a different vector dimension.
    ///
    /// Fatal for that load attempt; the lifecycle manager forces a rebuild.
    #[error("index dimension mismatch: expected {expected}, found {actual}")]
    FormatMismatch {
        /// Configured dimension.
        expected: usize,
        /// Dimension recorded in the file.
        actual: usize,
    },

    /// The hash store could not be reached.
    ///
    /// Aborts a rebuild; the previous index keeps serving.
    #[error("data source unavailable during '{operation}': {cause}")]
    DataSourceUnavailable {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// Feature not enabled (requires feature flag).
    #[error("feature not enabled: {0} (compile with --features {0})")]
    FeatureNotEnabled(String),
}

impl Error {
    /// Returns true for transient conditions that are worth retrying.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NoIndexAvailable(_)
                | Self::LockUnavailable { .. }
                | Self::DataSourceUnavailable { .. }
        )
    }

    /// Shorthand for an `OperationFailed` error.
    pub fn operation(operation: impl Into<String>, cause: impl ToString) -> Self {
        Self::OperationFailed {
            operation: operation.into(),
            cause: cause.to_string(),
        }
    }

    /// Shorthand for a `DataSourceUnavailable` error.
    pub fn data_source(operation: impl Into<String>, cause: impl ToString) -> Self {
        Self::DataSourceUnavailable {
            operation: operation.into(),
            cause: cause.to_string(),
        }
    }
}

/// Result type alias for repostscan operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Returns the current Unix timestamp in seconds.
///
/// Falls back to 0 if the system clock is before the Unix epoch.
///
/// # Examples
///
/// ```rust
/// use repostscan::current_timestamp;
///
/// assert!(current_timestamp() > 0);
/// ```
#[must_use]
pub fn current_timestamp() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidInput("test error".to_string());
        assert_eq!(err.to_string(), "invalid input: test error");

        let err = Error::OperationFailed {
            operation: "test".to_string(),
            cause: "failed".to_string(),
        };
        assert_eq!(err.to_string(), "operation 'test' failed: failed");

        let err = Error::FormatMismatch {
            expected: 256,
            actual: 64,
        };
        assert_eq!(
            err.to_string(),
            "index dimension mismatch: expected 256, found 64"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::NoIndexAvailable("busy".to_string()).is_retryable());
        assert!(
            Error::LockUnavailable {
                name: "image-index".to_string()
            }
            .is_retryable()
        );
        assert!(Error::data_source("page_hashes", "connection refused").is_retryable());
        assert!(!Error::ImageConversion("truncated".to_string()).is_retryable());
        assert!(
            !Error::FormatMismatch {
                expected: 256,
                actual: 64
            }
            .is_retryable()
        );
    }
}
