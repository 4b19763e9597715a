//! Perceptual image hashing.
//!
//! Produces the difference hash (dhash) used as the matching key for image
//! posts, and the Hamming helpers that compare two hashes exactly.

mod dhash;
mod hash;

pub use dhash::{DEFAULT_HASH_SIZE, PerceptualHasher, bits_set};
pub use hash::ImageHash;
