//! Error types for the gencodedoc engine
//!
//! This module defines all error types that can occur during snapshot
//! operations. Every user-facing failure maps onto exactly one variant so
//! the request router can surface a stable error kind without leaking
//! backtraces into the reply envelope.

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the gencodedoc engine
pub type Result<T> = std::result::Result<T, SnapError>;

/// Main error type for all snapshot-engine operations
#[derive(Debug, Error)]
pub enum SnapError {
    /// No metadata store present for the project
    #[error("Project not initialized at {0:?}. Run init_project first.")]
    NotInitialized(PathBuf),

    /// Snapshot lookup by id or tag failed
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// File path not present in the referenced snapshot
    #[error("File '{path}' not found in snapshot '{snapshot}'")]
    FileNotInSnapshot {
        /// Project-relative path that was requested
        path: String,
        /// Snapshot reference used for the lookup
        snapshot: String,
    },

    /// Content blob row vanished while a snapshot still references it
    #[error("Content missing for hash {0}")]
    ContentMissing(String),

    /// Attempted snapshot whose deterministic hash equals an existing one
    #[error("No changes detected since last snapshot")]
    NoChanges,

    /// Tag already used by another snapshot
    #[error("Tag '{0}' is already in use")]
    DuplicateTag(String),

    /// Restore target exists and force is false
    #[error("Path already exists: {0:?} (use force to overwrite)")]
    PathConflict(PathBuf),

    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors from the metadata database
    #[error("Database error: {0}")]
    Sql(#[from] rusqlite::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors during YAML configuration handling
    #[error("Config error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Compression or decompression failure
    #[error("Compression error: {0}")]
    Compression(String),

    /// File system observer failure
    #[error("Watch error: {0}")]
    Watch(String),

    /// Unknown mode, unknown diff format, bad ref parse, rejected tag
    #[error("Invalid argument: {0}")]
    Invalid(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<notify::Error> for SnapError {
    fn from(err: notify::Error) -> Self {
        SnapError::Watch(err.to_string())
    }
}

impl SnapError {
    /// Create a compression error with a custom message
    pub fn compression(msg: impl Into<String>) -> Self {
        SnapError::Compression(msg.into())
    }

    /// Create an invalid-argument error with a custom message
    pub fn invalid(msg: impl Into<String>) -> Self {
        SnapError::Invalid(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        SnapError::Internal(msg.into())
    }

    /// Whether this error is an expected, non-fatal outcome of a user
    /// request rather than a fault in the engine
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            SnapError::NoChanges | SnapError::SnapshotNotFound(_) | SnapError::PathConflict(_)
        )
    }

    /// Stable kind label surfaced in structured error envelopes
    pub fn kind(&self) -> &'static str {
        match self {
            SnapError::NotInitialized(_) => "not_initialized",
            SnapError::SnapshotNotFound(_) => "snapshot_not_found",
            SnapError::FileNotInSnapshot { .. } => "file_not_in_snapshot",
            SnapError::ContentMissing(_) => "content_missing",
            SnapError::NoChanges => "no_changes",
            SnapError::DuplicateTag(_) => "duplicate_tag",
            SnapError::PathConflict(_) => "path_conflict",
            SnapError::Io(_) => "io_fault",
            SnapError::Sql(_) => "io_fault",
            SnapError::Json(_) => "invalid",
            SnapError::Yaml(_) => "invalid",
            SnapError::Compression(_) => "io_fault",
            SnapError::Watch(_) => "io_fault",
            SnapError::Invalid(_) => "invalid",
            SnapError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SnapError::SnapshotNotFound("v1".to_string());
        assert_eq!(err.to_string(), "Snapshot not found: v1");
    }

    #[test]
    fn test_no_changes_message() {
        // The router's reply text for a no-op snapshot is built from this
        assert!(SnapError::NoChanges.to_string().contains("No changes detected"));
    }

    #[test]
    fn test_error_benign() {
        assert!(SnapError::NoChanges.is_benign());
        assert!(!SnapError::Internal("boom".to_string()).is_benign());
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(SnapError::DuplicateTag("v1".into()).kind(), "duplicate_tag");
        assert_eq!(
            SnapError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "x")).kind(),
            "io_fault"
        );
    }
}
