//! # gencodedoc - Project-local versioning engine
//!
//! A content-addressed snapshot store that captures the state of a working
//! tree, deduplicates file content across snapshots, compresses it at
//! rest, and exposes snapshots for inspection, diffing, partial restore
//! and export. A watcher-driven autosave loop decides when to cut
//! snapshots automatically.
//!
//! ## Architecture
//!
//! - **Content-addressed storage**: file bytes are stored once per
//!   SHA-256 content hash, shared by every snapshot that recorded them
//! - **SQLite metadata**: snapshots, file links, blobs and autosave state
//!   live in one `gencodedoc.db` under the project's `.gencodedoc/`
//!   directory, with snapshot creation wrapped in a single transaction
//! - **Zstandard compression**: blobs compress at rest; reads fall back
//!   transparently for blobs written while compression was disabled
//! - **Ignore-aware scanning**: directory, file, extension and
//!   gitignore-style rules prune the walk before hashing starts
//! - **Autosave**: timer, diff-threshold and hybrid policies with
//!   retention bounds on count and age
//! - **JSON-RPC surface**: a line-delimited request router exposes every
//!   operation to external callers over stdio
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use gencodedoc::config::ProjectConfig;
//! use gencodedoc::versioning::{CreateOptions, VersionManager};
//! use std::path::PathBuf;
//!
//! # fn main() -> gencodedoc::Result<()> {
//! let config = ProjectConfig::for_project(PathBuf::from("./my_project"));
//! let manager = VersionManager::init(&config)?;
//!
//! let snapshot = manager.create_snapshot(CreateOptions {
//!     message: Some("Initial state".to_string()),
//!     tag: Some("v1".to_string()),
//!     ..Default::default()
//! })?;
//! println!("Created snapshot {}", snapshot.metadata.id);
//!
//! // Make some changes, then inspect them
//! let diff = manager.diff("v1", "current", None)?;
//! println!("{} change(s), significance {:.2}", diff.total_changes, diff.significance);
//! # Ok(())
//! # }
//! ```

pub mod autosave;
pub mod compression;
pub mod config;
pub mod content_store;
pub mod database;
pub mod diff;
pub mod error;
pub mod ignore_rules;
pub mod router;
pub mod scanner;
pub mod types;
pub mod utils;
pub mod versioning;
pub mod watcher;

pub use autosave::{AutosaveController, AutosaveStatus};
pub use compression::Compressor;
pub use config::{AutosaveMode, ConfigManager, ProjectConfig};
pub use content_store::ContentStore;
pub use database::MetadataDB;
pub use diff::{DiffFormat, SnapshotDiff};
pub use error::{Result, SnapError};
pub use ignore_rules::IgnoreFilter;
pub use router::RequestRouter;
pub use scanner::Scanner;
pub use types::{FileEntry, Snapshot, SnapshotMetadata};
pub use versioning::{CreateOptions, VersionManager};
