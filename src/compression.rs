//! Zstandard compression for stored file content
//!
//! Content blobs are compressed at rest with zstd at a configurable level.
//! Decompression is format-agnostic: blobs written while compression was
//! disabled sit in the store as raw bytes, so [`Compressor::decompress`]
//! detects the zstd frame magic and returns input without it unchanged.
//! Whether a given blob is compressed is a property of the write that
//! stored it, not of the store as a whole.

use crate::error::{Result, SnapError};
use tracing::trace;

/// Magic bytes opening every zstd frame
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Minimum accepted compression level
pub const MIN_LEVEL: i32 = 1;
/// Maximum accepted compression level
pub const MAX_LEVEL: i32 = 22;

/// Content compressor with a fixed level
#[derive(Debug, Clone)]
pub struct Compressor {
    level: i32,
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new(3)
    }
}

impl Compressor {
    /// Create a compressor, clamping the level into [1, 22]
    pub fn new(level: i32) -> Self {
        Self {
            level: level.clamp(MIN_LEVEL, MAX_LEVEL),
        }
    }

    /// Configured compression level
    pub fn level(&self) -> i32 {
        self.level
    }

    /// Compress data, returning (stored bytes, original size, stored size)
    pub fn compress(&self, data: &[u8]) -> Result<(Vec<u8>, u64, u64)> {
        let original_size = data.len() as u64;
        let compressed = zstd::stream::encode_all(data, self.level)
            .map_err(|e| SnapError::compression(format!("zstd encode failed: {}", e)))?;
        let stored_size = compressed.len() as u64;

        trace!(
            original_size,
            stored_size,
            level = self.level,
            "compressed blob"
        );

        Ok((compressed, original_size, stored_size))
    }

    /// Decompress data, falling back to the input for raw-stored blobs
    ///
    /// Input that does not open with the zstd frame magic was stored with
    /// compression disabled and is returned unchanged. Input that carries
    /// the magic but fails to decode is an error, never a fallback.
    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < ZSTD_MAGIC.len() || data[..4] != ZSTD_MAGIC {
            trace!(len = data.len(), "blob stored raw, returning as-is");
            return Ok(data.to_vec());
        }

        zstd::stream::decode_all(data)
            .map_err(|e| SnapError::compression(format!("zstd decode failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let compressor = Compressor::new(3);
        let data = b"fn main() { println!(\"hello\"); }\n".repeat(50);

        let (stored, original, stored_size) = compressor.compress(&data).unwrap();
        assert_eq!(original, data.len() as u64);
        assert_eq!(stored_size, stored.len() as u64);
        assert!(stored.len() < data.len());

        assert_eq!(compressor.decompress(&stored).unwrap(), data);
    }

    #[test]
    fn test_decompress_raw_passthrough() {
        // Blobs written with compression disabled come back unchanged
        let compressor = Compressor::default();
        let raw = b"plain text, never compressed";
        assert_eq!(compressor.decompress(raw).unwrap(), raw);
    }

    #[test]
    fn test_decompress_empty() {
        let compressor = Compressor::default();
        assert_eq!(compressor.decompress(b"").unwrap(), b"");
    }

    #[test]
    fn test_corrupt_frame_is_error() {
        let compressor = Compressor::default();
        let mut bogus = ZSTD_MAGIC.to_vec();
        bogus.extend_from_slice(b"not a real frame");
        assert!(compressor.decompress(&bogus).is_err());
    }

    #[test]
    fn test_level_clamped() {
        assert_eq!(Compressor::new(0).level(), 1);
        assert_eq!(Compressor::new(99).level(), 22);
        assert_eq!(Compressor::new(7).level(), 7);
    }

    #[test]
    fn test_cross_level_compatibility() {
        let data = b"content shared across snapshots".repeat(20);
        let (stored, _, _) = Compressor::new(19).compress(&data).unwrap();
        // Any compressor reads any level's output
        assert_eq!(Compressor::new(1).decompress(&stored).unwrap(), data);
    }
}
