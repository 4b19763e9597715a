//! Difference hash (dhash).
//!
//! # Algorithm
//!
//! 1. Convert to 8-bit grayscale
//! 2. Resize to `(N + 1) x N` with a Lanczos3 filter
//! 3. For each row, compare every horizontally adjacent pair: the bit is set
//!    when the left pixel is brighter than the right one
//! 4. Pack the `N * N` bits MSB-first in row-major order
//!
//! With the default `N = 16` this yields 256 bits, or 64 hex characters.
//! The output depends only on the decoded pixels, so lossless re-encodings of
//! the same image hash identically.

use super::ImageHash;
use crate::{Error, Result};
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage};
use tracing::instrument;

/// Default hash grid size.
pub const DEFAULT_HASH_SIZE: u32 = 16;

/// Computes difference hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerceptualHasher {
    hash_size: u32,
}

impl Default for PerceptualHasher {
    fn default() -> Self {
        Self::new(DEFAULT_HASH_SIZE)
    }
}

impl PerceptualHasher {
    /// Creates a hasher for an `hash_size x hash_size` bit grid.
    #[must_use]
    pub const fn new(hash_size: u32) -> Self {
        Self { hash_size }
    }

    /// Grid size `N`.
    #[must_use]
    pub const fn hash_size(&self) -> u32 {
        self.hash_size
    }

    /// Number of bits produced per hash (`N * N`).
    #[must_use]
    pub const fn bit_count(&self) -> usize {
        (self.hash_size as usize) * (self.hash_size as usize)
    }

    /// Decodes `image_data` and hashes it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ImageConversion`] if the bytes cannot be decoded.
    #[instrument(skip(self, image_data), fields(len = image_data.len()))]
    pub fn hash_bytes(&self, image_data: &[u8]) -> Result<ImageHash> {
        let image = image::load_from_memory(image_data)
            .map_err(|e| Error::ImageConversion(format!("failed to decode image: {e}")))?;
        self.hash_image(&image)
    }

    /// Hashes a decoded image.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ImageConversion`] for empty images or a zero grid.
    pub fn hash_image(&self, image: &DynamicImage) -> Result<ImageHash> {
        if image.width() == 0 || image.height() == 0 {
            return Err(Error::ImageConversion(
                "image has zero width or height".to_string(),
            ));
        }
        if self.hash_size == 0 {
            return Err(Error::ImageConversion("hash size must be positive".to_string()));
        }

        let gray = image.to_luma8();
        let resized = imageops::resize(
            &gray,
            self.hash_size + 1,
            self.hash_size,
            FilterType::Lanczos3,
        );
        Ok(self.pack_differences(&resized))
    }

    fn pack_differences(&self, resized: &GrayImage) -> ImageHash {
        let n = self.hash_size;
        let mut bytes = vec![0u8; self.bit_count().div_ceil(8)];
        let mut bit = 0usize;

        for y in 0..n {
            for x in 0..n {
                let left = resized.get_pixel(x, y)[0];
                let right = resized.get_pixel(x + 1, y)[0];
                if left > right {
                    bytes[bit / 8] |= 0x80 >> (bit % 8);
                }
                bit += 1;
            }
        }

        ImageHash::from_bytes(bytes)
    }
}

/// Counts the set bits of a hex-encoded hash.
///
/// Used by callers as a coarse bucketing signal; matching does not need it.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if `hex_hash` is not valid hex.
pub fn bits_set(hex_hash: &str) -> Result<u32> {
    Ok(ImageHash::from_hex(hex_hash)?.count_ones())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn gradient(width: u32, height: u32, descending: bool) -> DynamicImage {
        let img = RgbImage::from_fn(width, height, |x, _| {
            let step = u8::try_from(x / 2).unwrap_or(u8::MAX).min(170);
            let v = if descending { 230 - step } else { 30 + step };
            Rgb([v, v, v])
        });
        DynamicImage::ImageRgb8(img)
    }

    fn encode(image: &DynamicImage, format: ImageFormat) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        image.write_to(&mut buf, format).unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_hash_length() {
        let hash = PerceptualHasher::default()
            .hash_image(&gradient(170, 160, false))
            .unwrap();
        assert_eq!(hash.bit_len(), 256);
        assert_eq!(hash.to_hex().len(), 64);
    }

    #[test]
    fn test_ascending_gradient_sets_no_bits() {
        let hash = PerceptualHasher::default()
            .hash_image(&gradient(340, 160, false))
            .unwrap();
        assert_eq!(hash.count_ones(), 0);
        assert_eq!(hash.to_hex(), "0".repeat(64));
    }

    #[test]
    fn test_descending_gradient_sets_most_bits() {
        let hash = PerceptualHasher::default()
            .hash_image(&gradient(340, 160, true))
            .unwrap();
        assert!(hash.count_ones() > 200);
    }

    #[test]
    fn test_hash_is_deterministic() {
        let hasher = PerceptualHasher::default();
        let data = encode(&gradient(64, 48, true), ImageFormat::Png);
        assert_eq!(
            hasher.hash_bytes(&data).unwrap(),
            hasher.hash_bytes(&data).unwrap()
        );
    }

    #[test]
    fn test_lossless_reencoding_is_stable() {
        let hasher = PerceptualHasher::default();
        let image = gradient(120, 90, true);
        let png = hasher
            .hash_bytes(&encode(&image, ImageFormat::Png))
            .unwrap();
        let bmp = hasher
            .hash_bytes(&encode(&image, ImageFormat::Bmp))
            .unwrap();
        assert_eq!(png.hamming_distance(&bmp).unwrap(), 0);
    }

    #[test]
    fn test_undecodable_bytes() {
        let result = PerceptualHasher::default().hash_bytes(b"definitely not an image");
        assert!(matches!(result, Err(Error::ImageConversion(_))));
    }

    #[test]
    fn test_small_grid() {
        let hash = PerceptualHasher::new(8)
            .hash_image(&gradient(90, 80, false))
            .unwrap();
        assert_eq!(hash.bit_len(), 64);
    }

    #[test]
    fn test_bits_set() {
        assert_eq!(bits_set("ff00").unwrap(), 8);
        assert_eq!(bits_set("0000").unwrap(), 0);
        assert!(bits_set("zz").is_err());
    }
}
