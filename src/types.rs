//! Core data types shared across the snapshot engine
//!
//! The types in this module represent:
//! - **Snapshot state**: [`FileEntry`], [`SnapshotMetadata`], [`Snapshot`]
//! - **Operation results**: [`RestoreReport`], [`ExportReport`],
//!   [`FileHistoryEntry`], [`FileSearchResult`]
//! - **Autosave bookkeeping**: [`AutosaveState`]
//!
//! A snapshot owns no content; file entries reference content blobs stored
//! by hash in the metadata database, shared by every snapshot that recorded
//! the same bytes.

use chrono::{DateTime, Utc};
use globset::Glob;
use serde::{Deserialize, Serialize};

/// A file as it appears in one snapshot
///
/// Immutable once recorded. The path is project-relative and uses forward
/// slashes regardless of host separator; the hash is the lowercase hex
/// SHA-256 of the file's raw bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileEntry {
    /// Project-relative path, forward-slash normalized
    pub path: String,
    /// SHA-256 of file content, lowercase hex
    pub hash: String,
    /// File size in bytes
    pub size: u64,
    /// Unix file mode bits
    pub mode: u32,
}

/// Metadata row for one snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Monotonically increasing id assigned on create
    pub id: i64,
    /// Deterministic hash over the sorted (path, content-hash) pairs
    pub hash: String,
    /// Optional human message
    pub message: Option<String>,
    /// Optional tag, globally unique among snapshots when present
    pub tag: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Latest snapshot id at creation time
    pub parent_id: Option<i64>,
    /// Whether the autosave loop created this snapshot
    pub is_autosave: bool,
    /// What triggered the snapshot (manual, timer, diff_threshold, ...)
    pub trigger_type: String,
    /// Number of files recorded
    pub files_count: usize,
    /// Uncompressed total size of all files
    pub total_size: u64,
    /// Storage cost of blobs newly persisted during this creation
    pub compressed_size: u64,
}

impl SnapshotMetadata {
    /// Tag if present, otherwise the numeric id as a label
    pub fn label(&self) -> String {
        self.tag.clone().unwrap_or_else(|| self.id.to_string())
    }
}

/// A complete snapshot: metadata plus the ordered set of file entries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Snapshot metadata
    pub metadata: SnapshotMetadata,
    /// Files recorded by this snapshot
    pub files: Vec<FileEntry>,
}

impl Snapshot {
    /// Look up a file entry by exact project-relative path
    pub fn get_file(&self, path: &str) -> Option<&FileEntry> {
        self.files.iter().find(|f| f.path == path)
    }

    /// Files whose path matches any of the given filters
    ///
    /// A filter matches when it glob-matches the full path or when the path
    /// starts with the filter as a literal prefix, so both `src/*.rs` and
    /// `src/` select files under `src`.
    pub fn files_matching(&self, filters: &[String]) -> Vec<FileEntry> {
        self.files
            .iter()
            .filter(|f| path_matches_any(&f.path, filters))
            .cloned()
            .collect()
    }
}

/// Whether `path` matches the filter as a glob or as a literal prefix
pub fn path_matches(path: &str, filter: &str) -> bool {
    if path == filter || path.starts_with(filter) {
        return true;
    }
    match Glob::new(filter) {
        Ok(glob) => glob.compile_matcher().is_match(path),
        Err(_) => false,
    }
}

/// Whether `path` matches any filter in the list
pub fn path_matches_any(path: &str, filters: &[String]) -> bool {
    filters.iter().any(|f| path_matches(path, f))
}

/// Report produced by full and partial restore
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreReport {
    /// Number of files written
    pub restored: usize,
    /// Number of files skipped (existing target without force, or missing content)
    pub skipped: usize,
    /// Number of files selected for restore
    pub total: usize,
    /// Paths written
    pub files_restored: Vec<String>,
    /// Paths skipped
    pub files_skipped: Vec<String>,
}

/// Report produced by snapshot export
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportReport {
    /// Label of the exported snapshot (tag or id)
    pub snapshot: String,
    /// "folder" or "tar.gz"
    pub format: String,
    /// Final output path (archive exports force the .tar.gz suffix)
    pub output_path: String,
    /// Number of files exported
    pub exported: usize,
    /// Number of files whose content could not be read
    pub failed: usize,
    /// Archive size in bytes; zero for folder exports
    pub archive_size: u64,
    /// Paths exported
    pub files_exported: Vec<String>,
    /// Paths that failed
    pub files_failed: Vec<String>,
}

/// Status of a file within one step of its history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    /// First snapshot in which the file appears
    Added,
    /// Content hash differs from the previous appearance
    Modified,
    /// Present with the same content hash as before
    Unchanged,
    /// Previously present, absent in this snapshot
    Removed,
}

/// One step in a file's history across snapshots
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileHistoryEntry {
    /// Snapshot in which this step was observed
    pub snapshot_id: i64,
    /// Tag of that snapshot, if any
    pub tag: Option<String>,
    /// Snapshot creation time
    pub created_at: DateTime<Utc>,
    /// What happened to the file at this step
    pub status: HistoryStatus,
    /// Content hash at this step; None for removals
    pub hash: Option<String>,
    /// File size at this step; None for removals
    pub size: Option<u64>,
}

/// A single matching line within a search hit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchMatch {
    /// 1-based line number
    pub line_number: usize,
    /// Trimmed line content
    pub line: String,
}

/// Per-file search result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSearchResult {
    /// Snapshot the hit was found in
    pub snapshot_id: i64,
    /// Snapshot label (tag or id)
    pub snapshot_label: String,
    /// Project-relative path of the matching file
    pub path: String,
    /// First matching lines, capped at five
    pub matches: Vec<SearchMatch>,
    /// Total match count across the whole file
    pub total_matches: usize,
}

/// Singleton bookkeeping row for the autosave loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutosaveState {
    /// Last time the check loop woke
    pub last_check: Option<DateTime<Utc>>,
    /// Last successful autosave
    pub last_save: Option<DateTime<Utc>>,
    /// Id of the last autosave snapshot
    pub last_snapshot_id: Option<i64>,
    /// Number of files tracked at the last save
    pub files_tracked: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str) -> FileEntry {
        FileEntry {
            path: path.to_string(),
            hash: "0".repeat(64),
            size: 1,
            mode: 0o644,
        }
    }

    fn snapshot_with(paths: &[&str]) -> Snapshot {
        Snapshot {
            metadata: SnapshotMetadata {
                id: 1,
                hash: String::new(),
                message: None,
                tag: None,
                created_at: Utc::now(),
                parent_id: None,
                is_autosave: false,
                trigger_type: "manual".to_string(),
                files_count: paths.len(),
                total_size: 0,
                compressed_size: 0,
            },
            files: paths.iter().map(|p| entry(p)).collect(),
        }
    }

    #[test]
    fn test_get_file() {
        let snap = snapshot_with(&["a.txt", "b/c.py"]);
        assert!(snap.get_file("b/c.py").is_some());
        assert!(snap.get_file("missing").is_none());
    }

    #[test]
    fn test_files_matching_glob_and_prefix() {
        let snap = snapshot_with(&["src/main.rs", "src/lib.rs", "README.md"]);

        let by_glob = snap.files_matching(&["*.rs".to_string()]);
        assert_eq!(by_glob.len(), 2);

        let by_prefix = snap.files_matching(&["src/".to_string()]);
        assert_eq!(by_prefix.len(), 2);

        let exact = snap.files_matching(&["README.md".to_string()]);
        assert_eq!(exact.len(), 1);
    }

    #[test]
    fn test_path_matches_bad_glob_is_prefix_only() {
        // An unparseable glob still works as a literal prefix
        assert!(path_matches("a[b/c.txt", "a[b/"));
        assert!(!path_matches("other.txt", "a[b"));
    }

    #[test]
    fn test_metadata_label() {
        let mut snap = snapshot_with(&[]);
        assert_eq!(snap.metadata.label(), "1");
        snap.metadata.tag = Some("v1".to_string());
        assert_eq!(snap.metadata.label(), "v1");
    }
}
