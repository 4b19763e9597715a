//! Meme template model.

use crate::hashing::ImageHash;
use serde::{Deserialize, Serialize};

/// Hash of a popular image template.
///
/// Posts made from the same template share most of their pixels, so their
/// hashes sit close together even when the captions differ. When a checked
/// image lies within `tolerance` of a template, matches must clear the
/// stricter meme cutoff instead of the general one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemeTemplate {
    /// Template name.
    pub name: String,
    /// Template hash.
    pub hash: ImageHash,
    /// Distance from the template under which an image counts as this meme.
    pub tolerance: u32,
    /// Per-template match cutoff overriding the configured meme cutoff.
    pub match_cutoff: Option<u32>,
}

impl MemeTemplate {
    /// Creates a template without a cutoff override.
    #[must_use]
    pub fn new(name: impl Into<String>, hash: ImageHash, tolerance: u32) -> Self {
        Self {
            name: name.into(),
            hash,
            tolerance,
            match_cutoff: None,
        }
    }

    /// Sets the per-template cutoff.
    #[must_use]
    pub const fn with_match_cutoff(mut self, cutoff: u32) -> Self {
        self.match_cutoff = Some(cutoff);
        self
    }

    /// Whether `hash` is an instance of this template.
    ///
    /// Hashes of a different length never match.
    #[must_use]
    pub fn covers(&self, hash: &ImageHash) -> bool {
        self.hash
            .hamming_distance(hash)
            .is_ok_and(|d| d <= self.tolerance)
    }
}
