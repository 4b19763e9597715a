//! Business logic services.
//!
//! Services orchestrate storage backends and the index:
//! - [`IndexLifecycleManager`]: loads, rebuilds and swaps the active index
//! - [`MatchFilterPipeline`]: turns raw neighbours into qualifying matches
//! - [`RepostCheckService`]: end-to-end repost verdict for one post
//! - [`RetryPolicy`]: bounded exponential backoff used around the rebuild lock

mod index_manager;
mod match_filter;
mod repost_check;
mod retry;

pub use index_manager::{
    ActiveIndex, INDEX_TYPE, IndexLifecycleManager, IndexManagerSettings, IndexStatus,
    REBUILD_LOCK_NAME,
};
pub use match_filter::{FilterOutcome, MatchFilterConfig, MatchFilterPipeline};
pub use repost_check::{FsImageFetcher, ImageFetcher, RepostCheckService};
pub use retry::RetryPolicy;
