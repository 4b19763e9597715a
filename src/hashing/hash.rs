//! Packed perceptual hash value.

use crate::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A perceptual hash as a packed, MSB-first bit string.
///
/// Serialized as lowercase hex, which is also how the hash store keeps it.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ImageHash {
    bytes: Vec<u8>,
}

impl ImageHash {
    /// Wraps already packed bytes.
    #[must_use]
    pub const fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Parses a hex-encoded hash.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the string is empty or not valid hex.
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let hex_str = hex_str.trim();
        if hex_str.is_empty() {
            return Err(Error::InvalidInput("empty hash string".to_string()));
        }
        let bytes = hex::decode(hex_str)
            .map_err(|e| Error::InvalidInput(format!("invalid hash hex '{hex_str}': {e}")))?;
        Ok(Self { bytes })
    }

    /// Returns the hash as lowercase hex.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }

    /// Returns the packed bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Length of the hex representation.
    #[must_use]
    pub const fn hex_len(&self) -> usize {
        self.bytes.len() * 2
    }

    /// Number of bits in the hash.
    #[must_use]
    pub const fn bit_len(&self) -> usize {
        self.bytes.len() * 8
    }

    /// Number of set bits.
    #[must_use]
    pub fn count_ones(&self) -> u32 {
        self.bytes.iter().map(|b| b.count_ones()).sum()
    }

    /// Exact Hamming distance to `other`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the hashes have different lengths;
    /// hashes from different grid sizes are not comparable.
    pub fn hamming_distance(&self, other: &Self) -> Result<u32> {
        if self.bytes.len() != other.bytes.len() {
            return Err(Error::InvalidInput(format!(
                "hash length mismatch: {} vs {} bits",
                self.bit_len(),
                other.bit_len()
            )));
        }
        Ok(self
            .bytes
            .iter()
            .zip(&other.bytes)
            .map(|(a, b)| (a ^ b).count_ones())
            .sum())
    }

    /// Fraction of matching bits for a given Hamming distance.
    ///
    /// Computed as `(hex_len * 4 - distance) / (hex_len * 4)`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn match_percent(&self, distance: u32) -> f64 {
        let bits = (self.hex_len() * 4) as f64;
        if bits == 0.0 {
            return 0.0;
        }
        (bits - f64::from(distance)) / bits
    }
}

impl fmt::Display for ImageHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ImageHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ImageHash({})", self.to_hex())
    }
}

impl FromStr for ImageHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for ImageHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ImageHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}
