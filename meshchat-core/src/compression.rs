//! Payload compression: raw DEFLATE behind a cheap entropy check.

use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

/// Payloads shorter than this are never compressed.
pub const COMPRESSION_THRESHOLD: usize = 100;

/// Distinct-byte ratio at or above which data is treated as already dense.
const MAX_UNIQUE_RATIO: f64 = 0.9;

/// Entropy heuristic: at least [`COMPRESSION_THRESHOLD`] bytes, and fewer than 90% distinct
/// byte values within the first `min(len, 256)` bytes.
pub fn should_compress(data: &[u8]) -> bool {
    if data.len() < COMPRESSION_THRESHOLD {
        return false;
    }
    let sample = &data[..data.len().min(256)];
    let mut seen = [false; 256];
    let mut unique = 0usize;
    for &b in sample {
        if !seen[b as usize] {
            seen[b as usize] = true;
            unique += 1;
        }
    }
    (unique as f64 / sample.len() as f64) < MAX_UNIQUE_RATIO
}

/// Raw DEFLATE, whether or not it shrinks the input.
pub fn deflate(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(data.len()), Compression::default());
    encoder.write_all(data).map_err(|_| CompressionError::Corrupt)?;
    encoder.finish().map_err(|_| CompressionError::Corrupt)
}

/// Compress `data`. Returns `None` when compression fails or does not shrink the input.
pub fn compress(data: &[u8]) -> Option<Vec<u8>> {
    let out = deflate(data).ok()?;
    (out.len() < data.len()).then_some(out)
}

/// Inflate at most `max` bytes. Reads one byte past the cap so an oversized stream is
/// reported instead of silently cut.
fn inflate_capped(data: &[u8], max: usize) -> Result<Vec<u8>, CompressionError> {
    let mut out = Vec::new();
    DeflateDecoder::new(data)
        .take(max as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|_| CompressionError::Corrupt)?;
    Ok(out)
}

/// Inflate a stream of unknown size, refusing output beyond `max` bytes.
pub fn inflate_bounded(data: &[u8], max: usize) -> Result<Vec<u8>, CompressionError> {
    let out = inflate_capped(data, max)?;
    if out.len() > max {
        return Err(CompressionError::TooLarge(max));
    }
    Ok(out)
}

/// Inflate `data`, which must expand to exactly `original_size` bytes.
pub fn decompress(data: &[u8], original_size: usize) -> Result<Vec<u8>, CompressionError> {
    let out = inflate_capped(data, original_size)?;
    if out.len() != original_size {
        return Err(CompressionError::SizeMismatch {
            expected: original_size,
            actual: out.len(),
        });
    }
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("corrupt compressed stream")]
    Corrupt,
    #[error("decompressed {actual} bytes, header declared {expected}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("decompressed data exceeds {0} bytes")]
    TooLarge(usize),
}
