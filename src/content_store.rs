//! Content-addressed blob access on top of the metadata store
//!
//! Bridges files on disk and [`MetadataDB`]: hashing happens in the
//! scanner, so this layer only reads bytes, applies the write-time
//! compression policy, and persists deduplicated blobs. Reads decompress
//! transparently whatever a past write stored, compressed or raw.

use crate::compression::Compressor;
use crate::database::MetadataDB;
use crate::error::Result;
use crate::utils;
use rusqlite::Transaction;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Blob ingest and retrieval keyed by content hash
#[derive(Debug)]
pub struct ContentStore {
    db: Arc<MetadataDB>,
    compressor: Compressor,
    compression_enabled: bool,
}

impl ContentStore {
    /// Create a store over an open metadata database
    pub fn new(db: Arc<MetadataDB>, compressor: Compressor, compression_enabled: bool) -> Self {
        Self {
            db,
            compressor,
            compression_enabled,
        }
    }

    /// Persist one file's content inside an open snapshot transaction
    ///
    /// Returns `(original_size, stored_size)` for this call's accounting:
    /// `(0, 0)` when the blob was already present, so a snapshot's
    /// `compressed_size` counts only storage it actually added.
    pub fn ingest_within(
        &self,
        tx: &Transaction,
        absolute_path: &Path,
        expected_hash: &str,
    ) -> Result<(u64, u64)> {
        if MetadataDB::content_exists_tx(tx, expected_hash)? {
            trace!(hash = expected_hash, "blob already stored, deduplicated");
            return Ok((0, 0));
        }

        let content = fs::read(absolute_path)?;
        let (stored, original_size, stored_size) = if self.compression_enabled {
            self.compressor.compress(&content)?
        } else {
            let len = content.len() as u64;
            (content, len, len)
        };

        MetadataDB::insert_content(tx, expected_hash, &stored, original_size, stored_size)?;
        debug!(
            hash = expected_hash,
            original_size, stored_size, "persisted new content blob"
        );
        Ok((original_size, stored_size))
    }

    /// Persist one file's content in its own transaction
    pub fn ingest(&self, absolute_path: &Path, expected_hash: &str) -> Result<(u64, u64)> {
        self.db
            .with_tx(|tx| self.ingest_within(tx, absolute_path, expected_hash))
    }

    /// Read and decompress a blob
    pub fn content_as_bytes(&self, hash: &str) -> Result<Option<Vec<u8>>> {
        match self.db.get_content(hash)? {
            Some(stored) => Ok(Some(self.compressor.decompress(&stored)?)),
            None => Ok(None),
        }
    }

    /// Read a blob as UTF-8 text; non-text content yields `None`
    pub fn content_as_text(&self, hash: &str) -> Result<Option<String>> {
        match self.content_as_bytes(hash)? {
            Some(bytes) => Ok(String::from_utf8(bytes).ok()),
            None => Ok(None),
        }
    }

    /// Write a blob's decompressed bytes to `target`, creating parent
    /// directories and applying mode bits
    ///
    /// Returns false when the blob is missing from the store.
    pub fn restore_file(&self, hash: &str, target: &Path, mode: u32) -> Result<bool> {
        let Some(bytes) = self.content_as_bytes(hash)? else {
            warn!(hash, target = %target.display(), "content missing, cannot restore");
            return Ok(false);
        };

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(target, &bytes)?;
        utils::set_file_mode(target, mode)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::hash_data;
    use tempfile::TempDir;

    fn store(dir: &TempDir, compression_enabled: bool) -> ContentStore {
        let db = Arc::new(MetadataDB::open(&dir.path().join("gencodedoc.db")).unwrap());
        ContentStore::new(db, Compressor::new(3), compression_enabled)
    }

    #[test]
    fn test_ingest_then_read_back() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, true);

        let file = dir.path().join("a.txt");
        let body = b"hello snapshot".repeat(100);
        fs::write(&file, &body).unwrap();
        let hash = hash_data(&body);

        let (original, stored) = store.ingest(&file, &hash).unwrap();
        assert_eq!(original, body.len() as u64);
        assert!(stored < original);

        assert_eq!(store.content_as_bytes(&hash).unwrap().unwrap(), body);
    }

    #[test]
    fn test_second_ingest_counts_zero() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, true);

        let file = dir.path().join("a.txt");
        fs::write(&file, b"same bytes").unwrap();
        let hash = hash_data(b"same bytes");

        let first = store.ingest(&file, &hash).unwrap();
        assert!(first.0 > 0);
        assert_eq!(store.ingest(&file, &hash).unwrap(), (0, 0));
    }

    #[test]
    fn test_uncompressed_write_reads_uniformly() {
        // A store with compression off writes raw rows; reads must still
        // decompress-or-passthrough transparently
        let dir = TempDir::new().unwrap();
        let raw_store = store(&dir, false);

        let file = dir.path().join("raw.txt");
        fs::write(&file, b"stored raw").unwrap();
        let hash = hash_data(b"stored raw");

        let (original, stored) = raw_store.ingest(&file, &hash).unwrap();
        assert_eq!(original, stored);
        assert_eq!(
            raw_store.content_as_bytes(&hash).unwrap().unwrap(),
            b"stored raw"
        );
    }

    #[test]
    fn test_content_as_text_rejects_binary() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, true);

        let file = dir.path().join("bin");
        let body = vec![0u8, 159, 146, 150, 255];
        fs::write(&file, &body).unwrap();
        let hash = hash_data(&body);
        store.ingest(&file, &hash).unwrap();

        assert!(store.content_as_text(&hash).unwrap().is_none());
    }

    #[test]
    fn test_restore_file_applies_mode() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, true);

        let file = dir.path().join("script.sh");
        fs::write(&file, b"#!/bin/sh\necho hi\n").unwrap();
        let hash = hash_data(b"#!/bin/sh\necho hi\n");
        store.ingest(&file, &hash).unwrap();

        let target = dir.path().join("restored").join("script.sh");
        assert!(store.restore_file(&hash, &target, 0o755).unwrap());
        assert_eq!(fs::read(&target).unwrap(), b"#!/bin/sh\necho hi\n");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&target).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o755);
        }
    }

    #[test]
    fn test_restore_missing_blob_is_false() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, true);
        let target = dir.path().join("out");
        assert!(!store.restore_file("0".repeat(64).as_str(), &target, 0o644).unwrap());
        assert!(!target.exists());
    }
}
