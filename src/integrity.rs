use image::imageops::FilterType;
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};

use crate::error::IntegrityError;

/// Compute SHA256 hash of a file asynchronously, as lowercase hex.
pub async fn sha256_sum(path: &Path) -> Result<String, IntegrityError> {
    let file = File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Normalizes a source-supplied digest: trims, lowercases and drops a
/// `sha256:` prefix.
pub fn normalize_hash(expected: &str) -> String {
    let trimmed = expected.trim();
    let bare = trimmed
        .strip_prefix("sha256:")
        .or_else(|| trimmed.strip_prefix("SHA256:"))
        .unwrap_or(trimmed);
    bare.to_ascii_lowercase()
}

/// 64-bit difference hash of an encoded image.
///
/// The image is reduced to 9x8 grayscale and each bit records whether a
/// pixel is brighter than its right-hand neighbour, so recompression and
/// rescaling move only a few bits. Returns `None` for undecodable input.
pub fn perceptual_hash(encoded: &[u8]) -> Option<u64> {
    let image = image::load_from_memory(encoded).ok()?;
    let small = image.resize_exact(9, 8, FilterType::Triangle).to_luma8();
    let mut hash = 0u64;
    for y in 0..8 {
        for x in 0..8 {
            let left = small.get_pixel(x, y)[0];
            let right = small.get_pixel(x + 1, y)[0];
            hash <<= 1;
            if left > right {
                hash |= 1;
            }
        }
    }
    Some(hash)
}

pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, ImageFormat, Rgb};
    use std::io::Cursor;

    fn gradient(width: u32, height: u32) -> image::DynamicImage {
        let buf = ImageBuffer::from_fn(width, height, |x, y| {
            let v = ((x * 255) / width.max(1)) as u8;
            Rgb([v, v / 2, ((y * 255) / height.max(1)) as u8])
        });
        image::DynamicImage::ImageRgb8(buf)
    }

    fn encode(img: &image::DynamicImage, format: ImageFormat) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, format).unwrap();
        out.into_inner()
    }

    #[tokio::test]
    async fn sha256_of_file_matches_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        tokio::fs::write(&path, b"hello world").await.unwrap();
        assert_eq!(
            sha256_sum(&path).await.unwrap(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn normalizes_prefixed_hashes() {
        assert_eq!(normalize_hash(" sha256:ABCDEF "), "abcdef");
        assert_eq!(normalize_hash("abc"), "abc");
    }

    #[test]
    fn rescaled_image_keeps_its_perceptual_hash_close() {
        let big = gradient(256, 128);
        let small = big.resize_exact(128, 64, FilterType::Triangle);
        let a = perceptual_hash(&encode(&big, ImageFormat::Png)).unwrap();
        let b = perceptual_hash(&encode(&small, ImageFormat::Png)).unwrap();
        assert!(hamming_distance(a, b) <= 6, "distance {}", hamming_distance(a, b));
    }

    #[test]
    fn mirrored_image_is_far_away() {
        let img = gradient(128, 64);
        let mirrored = img.fliph();
        let a = perceptual_hash(&encode(&img, ImageFormat::Png)).unwrap();
        let b = perceptual_hash(&encode(&mirrored, ImageFormat::Png)).unwrap();
        assert!(hamming_distance(a, b) > 32);
    }

    #[test]
    fn garbage_has_no_perceptual_hash() {
        assert_eq!(perceptual_hash(b"definitely not an image"), None);
    }
}
