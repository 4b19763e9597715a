//! Hash store trait.
//!
//! The hash store is the post database as the core sees it: a corpus of
//! `(row id, perceptual hash)` pairs that can be streamed in pages during an
//! index rebuild, plus point lookups used to enrich query candidates.
//!
//! # Paging Contract
//!
//! Both paging methods return rows in ascending row id order. Over a static
//! corpus, walking pages until [`HashPage::is_last`] visits every hashed row
//! exactly once. [`HashStore::page_hashes_after`] (keyset
//! paging) keeps that guarantee even while rows are being inserted, which is
//! why the rebuild uses it.
//!
//! # Error Modes
//!
//! | Condition | Error |
//! |-----------|-------|
//! | Backend unreachable, query failed | `Error::DataSourceUnavailable` |
//! | Stored hash not valid hex | row skipped, warning logged |
//! | Unknown row id or post id | `Ok(None)` |

use crate::Result;
use crate::hashing::ImageHash;
use crate::models::{MemeTemplate, Post, PostId, RowId};

/// One page of hashed rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HashPage {
    /// Rows with a usable hash, ascending by row id.
    pub rows: Vec<(RowId, ImageHash)>,
    /// Raw rows read, including rows skipped for an unusable hash.
    pub scanned: usize,
    /// Highest row id read; the cursor for the next keyset page.
    pub last_row_id: Option<RowId>,
}

impl HashPage {
    /// Builds a page where every scanned row was usable.
    #[must_use]
    pub fn from_rows(rows: Vec<(RowId, ImageHash)>) -> Self {
        Self {
            scanned: rows.len(),
            last_row_id: rows.last().map(|(id, _)| *id),
            rows,
        }
    }

    /// Whether this is the final page for a request of `limit` rows.
    #[must_use]
    pub const fn is_last(&self, limit: usize) -> bool {
        self.scanned < limit
    }
}

/// Trait for perceptual hash stores.
///
/// # Implementor Notes
///
/// - Methods use `&self` to enable sharing via `Arc<dyn HashStore>`
/// - Use interior mutability (e.g., `Mutex<Connection>`) for mutable state
/// - Implement `get_posts()` with a batched query (e.g., SQL `IN` clause)
pub trait HashStore: Send + Sync {
    /// Returns up to `limit` hashed rows starting at `offset`, ascending by
    /// row id.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::DataSourceUnavailable`] if the store cannot be read.
    fn page_hashes(&self, offset: usize, limit: usize) -> Result<HashPage>;

    /// Returns up to `limit` hashed rows with row id greater than `after`
    /// (or from the start when `None`), ascending by row id.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::DataSourceUnavailable`] if the store cannot be read.
    fn page_hashes_after(&self, after: Option<RowId>, limit: usize) -> Result<HashPage>;

    /// Number of hashed rows.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::DataSourceUnavailable`] if the store cannot be read.
    fn count_hashes(&self) -> Result<usize>;

    /// Looks up a post by row id.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::DataSourceUnavailable`] if the store cannot be read.
    fn get_post(&self, row_id: RowId) -> Result<Option<Post>>;

    /// Looks up many posts at once, preserving input order.
    ///
    /// Default implementation calls [`Self::get_post`] per id.
    ///
    /// # Errors
    ///
    /// Returns an error if any lookup fails.
    fn get_posts(&self, row_ids: &[RowId]) -> Result<Vec<Option<Post>>> {
        row_ids.iter().map(|&id| self.get_post(id)).collect()
    }

    /// Looks up a post by its external id.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::DataSourceUnavailable`] if the store cannot be read.
    fn get_post_by_post_id(&self, post_id: &PostId) -> Result<Option<Post>>;

    /// Returns the stored hash for a post, if it has one.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::DataSourceUnavailable`] if the store cannot be read.
    fn get_hash_by_post_id(&self, post_id: &PostId) -> Result<Option<ImageHash>> {
        Ok(self
            .get_post_by_post_id(post_id)?
            .and_then(|post| post.image_hash))
    }

    /// Stores a freshly computed hash for a post.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn update_hash(&self, row_id: RowId, hash: &ImageHash) -> Result<()>;

    /// Known meme templates. Stores without templates return none.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::DataSourceUnavailable`] if the store cannot be read.
    fn meme_templates(&self) -> Result<Vec<MemeTemplate>> {
        Ok(Vec::new())
    }
}
