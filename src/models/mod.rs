//! Data models for repostscan.
//!
//! Posts are owned by the external post store; the core only reads them and
//! produces candidates, matches and check results.

mod generation;
mod matching;
mod meme;
mod post;

pub use generation::{BuildRecord, IndexGeneration, IndexState};
pub use matching::{Candidate, FilterStats, Match, RepostResult};
pub use meme::MemeTemplate;
pub use post::{Post, PostId, PostType, RowId};
