//! Approximate nearest-neighbour index over perceptual hashes.
//!
//! Vectors are perceptual hashes unpacked into one 0/1 component per bit and
//! kept packed in memory. The native distance is Euclidean over those
//! components, which is exactly `sqrt(hamming)`, so the approximate distance
//! ranks candidates the same way the exact Hamming check does. Recall is
//! still approximate: the forest only examines `search_budget` items.
//!
//! The index is build-once: items are added, [`ApproximateIndex::build`] is
//! called once, and from then on it only answers queries.

mod format;
mod forest;

pub use format::{FORMAT_VERSION, IndexHeader, MAGIC};

use crate::hashing::ImageHash;
use crate::models::{Candidate, RowId};
use crate::{Error, Result};
use forest::{Forest, ItemTable, hamming};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;
use tracing::{debug, instrument};

/// Default maximum number of items per leaf.
pub const DEFAULT_LEAF_SIZE: usize = 32;

/// Approximate distance the index reports for a Hamming distance.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn distance_for_hamming(hamming: u32) -> f32 {
    (hamming as f32).sqrt()
}

/// Random-split forest over fixed-length bit vectors.
#[derive(Debug, Clone)]
pub struct ApproximateIndex {
    dimension: usize,
    leaf_size: usize,
    seed: Option<u64>,
    tree_count: usize,
    items: ItemTable,
    forest: Option<Forest>,
}

impl ApproximateIndex {
    /// Creates an empty index for vectors of `dimension` bits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if `dimension` is zero.
    pub fn new(dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(Error::InvalidInput(
                "index dimension must be greater than 0".to_string(),
            ));
        }
        Ok(Self {
            dimension,
            leaf_size: DEFAULT_LEAF_SIZE,
            seed: None,
            tree_count: 0,
            items: ItemTable::new(dimension.div_ceil(8)),
            forest: None,
        })
    }

    /// Fixes the build seed so tree construction is reproducible.
    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Sets the maximum leaf size.
    #[must_use]
    pub fn with_leaf_size(mut self, leaf_size: usize) -> Self {
        self.leaf_size = leaf_size.max(1);
        self
    }

    /// Bits per vector.
    #[must_use]
    pub const fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of trees (zero before build).
    #[must_use]
    pub const fn tree_count(&self) -> usize {
        self.tree_count
    }

    /// Number of items added.
    #[must_use]
    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    /// Whether [`Self::build`] has run.
    #[must_use]
    pub const fn is_built(&self) -> bool {
        self.forest.is_some()
    }

    fn check_vector(&self, vector: &[u8]) -> Result<()> {
        if vector.len() == self.items.stride {
            Ok(())
        } else {
            Err(Error::InvalidInput(format!(
                "vector has {} bytes, index expects {} ({} bits)",
                vector.len(),
                self.items.stride,
                self.dimension
            )))
        }
    }

    /// Adds one packed vector.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] after build or on a length mismatch.
    pub fn add_item(&mut self, row_id: RowId, vector: &[u8]) -> Result<()> {
        if self.is_built() {
            return Err(Error::InvalidInput(
                "cannot add items after build".to_string(),
            ));
        }
        self.check_vector(vector)?;
        if u32::try_from(self.items.len()).is_err() {
            return Err(Error::InvalidInput("index is full".to_string()));
        }
        self.items.push(row_id, vector);
        Ok(())
    }

    /// Adds a perceptual hash.
    ///
    /// # Errors
    ///
    /// See [`Self::add_item`].
    pub fn add_hash(&mut self, row_id: RowId, hash: &ImageHash) -> Result<()> {
        self.add_item(row_id, hash.as_bytes())
    }

    /// Builds `tree_count` trees. Valid with zero items.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if already built or `tree_count` is 0.
    #[instrument(skip(self), fields(items = self.items.len()))]
    pub fn build(&mut self, tree_count: usize) -> Result<()> {
        if self.is_built() {
            return Err(Error::InvalidInput("index is already built".to_string()));
        }
        if tree_count == 0 {
            return Err(Error::InvalidInput(
                "tree count must be greater than 0".to_string(),
            ));
        }

        let seed = self.seed.unwrap_or_else(|| rand::rng().random());
        let mut rng = StdRng::seed_from_u64(seed);
        let forest = Forest::build(
            &self.items,
            self.dimension,
            tree_count,
            self.leaf_size,
            &mut rng,
        );
        debug!(nodes = forest.nodes.len(), tree_count, "index built");

        self.tree_count = tree_count;
        self.forest = Some(forest);
        Ok(())
    }

    /// Returns up to `k` nearest items by Euclidean distance over bit
    /// components, ascending, ties broken by row id.
    ///
    /// `search_budget` caps the number of candidate items examined; 0 means
    /// `tree_count * k`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] before build or on a length mismatch.
    pub fn query(&self, vector: &[u8], k: usize, search_budget: usize) -> Result<Vec<Candidate>> {
        let Some(forest) = &self.forest else {
            return Err(Error::InvalidInput("index has not been built".to_string()));
        };
        self.check_vector(vector)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let budget = if search_budget == 0 {
            self.tree_count.saturating_mul(k)
        } else {
            search_budget
        };

        let mut scored: Vec<(u32, RowId)> = forest
            .candidates(vector, budget.max(k))
            .into_iter()
            .map(|item| {
                (
                    hamming(vector, self.items.vector(item)),
                    self.items.row_ids[item as usize],
                )
            })
            .collect();
        scored.sort_unstable();
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(distance, row_id)| Candidate::new(row_id, distance_for_hamming(distance)))
            .collect())
    }

    /// Queries with a perceptual hash.
    ///
    /// # Errors
    ///
    /// See [`Self::query`].
    pub fn query_hash(&self, hash: &ImageHash, k: usize, search_budget: usize) -> Result<Vec<Candidate>> {
        self.query(hash.as_bytes(), k, search_budget)
    }

    /// Writes the built index to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] before build and
    /// [`Error::OperationFailed`] on I/O errors.
    pub fn save(&self, path: &Path) -> Result<()> {
        let Some(forest) = &self.forest else {
            return Err(Error::InvalidInput(
                "cannot save an index that has not been built".to_string(),
            ));
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| Error::operation("create_index_dir", e))?;
        }

        let file = File::create(path).map_err(|e| Error::operation("create_index_file", e))?;
        let mut writer = BufWriter::new(file);
        let header = IndexHeader {
            dimension: self.dimension,
            tree_count: self.tree_count,
            leaf_size: self.leaf_size,
            item_count: self.items.len(),
        };
        format::write_index(&mut writer, &header, &self.items, forest)?;
        writer
            .into_inner()
            .map_err(|e| Error::operation("write_index", e))?
            .sync_all()
            .map_err(|e| Error::operation("sync_index", e))
    }

    /// Loads a built index from `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FormatMismatch`] if the file was built for a
    /// different dimension and [`Error::OperationFailed`] if it cannot be
    /// read or is corrupt.
    pub fn load(path: &Path, dimension: usize) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::operation("open_index_file", e))?;
        let mut reader = BufReader::new(file);
        let header = format::read_header(&mut reader, dimension)?;
        let (items, forest) = format::read_body(&mut reader, &header)?;

        Ok(Self {
            dimension: header.dimension,
            leaf_size: header.leaf_size,
            seed: None,
            tree_count: header.tree_count,
            items,
            forest: Some(forest),
        })
    }

    /// Reads only the header of an index file.
    ///
    /// # Errors
    ///
    /// See [`Self::load`].
    pub fn read_header(path: &Path, dimension: usize) -> Result<IndexHeader> {
        let file = File::open(path).map_err(|e| Error::operation("open_index_file", e))?;
        format::read_header(&mut BufReader::new(file), dimension)
    }
}
