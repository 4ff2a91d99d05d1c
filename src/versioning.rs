//! Snapshot orchestration
//!
//! [`VersionManager`] ties the scanner, the content store and the metadata
//! database together into the engine's public contract: create snapshots,
//! retrieve them by id or tag, diff them against each other or the live
//! working tree, restore or export their files, follow a file's history,
//! search stored content and render changelogs.
//!
//! Snapshot creation is atomic: the metadata row, every file link and
//! every newly persisted blob commit in one transaction, so a failure
//! partway leaves no trace.

use crate::compression::Compressor;
use crate::config::ProjectConfig;
use crate::content_store::ContentStore;
use crate::database::{MetadataDB, NewSnapshot};
use crate::diff::{self, DiffFormat, ModifiedFileText, SnapshotDiff};
use crate::error::{Result, SnapError};
use crate::ignore_rules::IgnoreFilter;
use crate::scanner::Scanner;
use crate::types::{
    ExportReport, FileEntry, FileHistoryEntry, FileSearchResult, HistoryStatus, RestoreReport,
    SearchMatch, Snapshot, SnapshotMetadata,
};
use chrono::Utc;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Reserved reference meaning "the working tree right now"
pub const CURRENT_REF: &str = "current";

/// Maximum files returned by a content search
const SEARCH_FILE_CAP: usize = 50;
/// Maximum matching lines reported per file
const SEARCH_LINE_CAP: usize = 5;

/// Options for snapshot creation
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Optional human message
    pub message: Option<String>,
    /// Optional unique tag
    pub tag: Option<String>,
    /// Restrict the scan to these files or directories
    pub include_paths: Option<Vec<String>>,
    /// Drop these exact project-relative paths after the scan
    pub exclude_paths: Option<Vec<String>>,
    /// Whether the autosave loop is creating this snapshot
    pub is_autosave: bool,
    /// Trigger label recorded on the snapshot
    pub trigger_type: String,
}

/// Orchestrates snapshot creation, retrieval, diffing, restore and export
pub struct VersionManager {
    project_path: PathBuf,
    storage_dir: PathBuf,
    scanner: Scanner,
    db: Arc<MetadataDB>,
    store: ContentStore,
    unified_context: usize,
}

impl std::fmt::Debug for VersionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionManager")
            .field("project_path", &self.project_path)
            .finish_non_exhaustive()
    }
}

impl VersionManager {
    /// Open the manager for an already-initialized project
    ///
    /// Fails with [`SnapError::NotInitialized`] when the metadata store is
    /// absent.
    pub fn open(config: &ProjectConfig) -> Result<Self> {
        let db_path = config.database_path();
        if !db_path.exists() {
            return Err(SnapError::NotInitialized(config.project_path.clone()));
        }
        Self::build(config)
    }

    /// Open the manager, creating the storage directory and database on
    /// first use
    pub fn init(config: &ProjectConfig) -> Result<Self> {
        Self::build(config)
    }

    fn build(config: &ProjectConfig) -> Result<Self> {
        let db = Arc::new(MetadataDB::open(&config.database_path())?);
        let filter = IgnoreFilter::new(
            &config.project_path,
            &config.ignore.dirs,
            &config.ignore.files,
            &config.ignore.extensions,
            &config.ignore.patterns,
            &config.storage_path,
        )?;
        let scanner = Scanner::new(config.project_path.clone(), filter);
        let store = ContentStore::new(
            Arc::clone(&db),
            Compressor::new(config.compression_level),
            config.compression_enabled,
        );

        Ok(Self {
            project_path: config.project_path.clone(),
            storage_dir: config.storage_dir(),
            scanner,
            db,
            store,
            unified_context: config.diff_format.unified_context,
        })
    }

    /// Project root this manager operates on
    pub fn project_path(&self) -> &Path {
        &self.project_path
    }

    /// Storage directory holding the metadata database
    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    /// The underlying metadata database
    pub fn database(&self) -> &MetadataDB {
        &self.db
    }

    /// The scanner used for live working-tree passes
    pub fn scanner(&self) -> &Scanner {
        &self.scanner
    }

    // ── creation ───────────────────────────────────────────────────

    /// Create a snapshot of the working tree
    ///
    /// Fails with [`SnapError::NoChanges`] when the deterministic snapshot
    /// hash equals an existing one, and [`SnapError::DuplicateTag`] when
    /// the tag is taken.
    pub fn create_snapshot(&self, opts: CreateOptions) -> Result<Snapshot> {
        if opts.tag.as_deref() == Some(CURRENT_REF) {
            return Err(SnapError::invalid(
                "'current' is a reserved reference and cannot be used as a tag",
            ));
        }

        let files = self.scanner.scan(
            opts.include_paths.as_deref(),
            opts.exclude_paths.as_deref(),
            false,
        )?;

        let snapshot_hash = snapshot_hash(&files);
        let parent_id = self.db.get_latest_snapshot()?.map(|s| s.id);
        let total_size: u64 = files.iter().map(|f| f.size).sum();

        let new = NewSnapshot {
            hash: snapshot_hash,
            message: opts.message,
            tag: opts.tag,
            parent_id,
            is_autosave: opts.is_autosave,
            trigger_type: if opts.trigger_type.is_empty() {
                "manual".to_string()
            } else {
                opts.trigger_type
            },
            files_count: files.len(),
            total_size,
        };

        let snapshot_id = self.db.with_tx(|tx| {
            let id = MetadataDB::insert_snapshot(tx, &new)?;
            let mut compressed_total = 0u64;
            for entry in &files {
                MetadataDB::add_file(tx, id, entry)?;
                let absolute = self.project_path.join(&entry.path);
                let (_, stored) = self.store.ingest_within(tx, &absolute, &entry.hash)?;
                compressed_total += stored;
            }
            MetadataDB::set_compressed_size(tx, id, compressed_total)?;
            Ok(id)
        })?;

        let metadata = self
            .db
            .get_snapshot(snapshot_id)?
            .ok_or_else(|| SnapError::internal("snapshot vanished after commit"))?;

        info!(
            id = metadata.id,
            files = metadata.files_count,
            trigger = metadata.trigger_type.as_str(),
            "created snapshot"
        );

        Ok(Snapshot { metadata, files })
    }

    // ── retrieval ──────────────────────────────────────────────────

    /// List snapshot headers newest-first
    pub fn list_snapshots(
        &self,
        limit: Option<usize>,
        include_autosave: bool,
    ) -> Result<Vec<SnapshotMetadata>> {
        self.db.list_snapshots(limit, include_autosave)
    }

    /// Resolve a reference (numeric id or tag) to a full snapshot
    pub fn get_snapshot(&self, snapshot_ref: &str) -> Result<Option<Snapshot>> {
        let metadata = match snapshot_ref.parse::<i64>() {
            Ok(id) => self.db.get_snapshot(id)?,
            Err(_) => self.db.get_snapshot_by_tag(snapshot_ref)?,
        };

        match metadata {
            Some(metadata) => {
                let files = self.db.snapshot_files(metadata.id)?;
                Ok(Some(Snapshot { metadata, files }))
            }
            None => Ok(None),
        }
    }

    fn require_snapshot(&self, snapshot_ref: &str) -> Result<Snapshot> {
        self.get_snapshot(snapshot_ref)?
            .ok_or_else(|| SnapError::SnapshotNotFound(snapshot_ref.to_string()))
    }

    /// Delete a snapshot by reference; false when it did not exist
    pub fn delete_snapshot(&self, snapshot_ref: &str) -> Result<bool> {
        match self.get_snapshot(snapshot_ref)? {
            Some(snapshot) => self.db.delete_snapshot(snapshot.metadata.id),
            None => Ok(false),
        }
    }

    // ── file content access ────────────────────────────────────────

    /// A file's entry and raw bytes as recorded at a snapshot
    pub fn get_file_at_version(
        &self,
        snapshot_ref: &str,
        file_path: &str,
    ) -> Result<(FileEntry, Vec<u8>)> {
        let snapshot = self.require_snapshot(snapshot_ref)?;
        let entry = snapshot
            .get_file(file_path)
            .ok_or_else(|| SnapError::FileNotInSnapshot {
                path: file_path.to_string(),
                snapshot: snapshot_ref.to_string(),
            })?
            .clone();

        let bytes = self
            .store
            .content_as_bytes(&entry.hash)?
            .ok_or_else(|| SnapError::ContentMissing(entry.hash.clone()))?;
        Ok((entry, bytes))
    }

    /// A file's UTF-8 text at a snapshot; None for binary content
    pub fn get_text_at_version(
        &self,
        snapshot_ref: &str,
        file_path: &str,
    ) -> Result<Option<String>> {
        let (_, bytes) = self.get_file_at_version(snapshot_ref, file_path)?;
        Ok(String::from_utf8(bytes).ok())
    }

    /// File entries at a snapshot, optionally filtered by a full-path glob
    pub fn list_files_at_version(
        &self,
        snapshot_ref: &str,
        pattern: Option<&str>,
    ) -> Result<Vec<FileEntry>> {
        let snapshot = self.require_snapshot(snapshot_ref)?;
        let mut files = match pattern {
            Some(pattern) => {
                let glob = globset::Glob::new(pattern)
                    .map_err(|e| SnapError::invalid(format!("bad glob '{}': {}", pattern, e)))?
                    .compile_matcher();
                snapshot
                    .files
                    .into_iter()
                    .filter(|f| glob.is_match(&f.path))
                    .collect()
            }
            None => snapshot.files,
        };
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    // ── restore ────────────────────────────────────────────────────

    /// Restore snapshot files to `target_dir` (default: the project root)
    ///
    /// Existing targets are skipped unless `force` is set. `file_filters`
    /// select files by glob or literal path prefix; without filters the
    /// whole snapshot is restored.
    pub fn restore(
        &self,
        snapshot_ref: &str,
        target_dir: Option<&Path>,
        force: bool,
        file_filters: Option<&[String]>,
    ) -> Result<RestoreReport> {
        let snapshot = self.require_snapshot(snapshot_ref)?;
        let target_dir = target_dir.unwrap_or(&self.project_path);

        let selected = match file_filters {
            Some(filters) if !filters.is_empty() => snapshot.files_matching(filters),
            _ => snapshot.files.clone(),
        };

        let mut restored = Vec::new();
        let mut skipped = Vec::new();

        for entry in &selected {
            let target = target_dir.join(&entry.path);
            if target.exists() && !force {
                skipped.push(entry.path.clone());
                continue;
            }
            if self.store.restore_file(&entry.hash, &target, entry.mode)? {
                restored.push(entry.path.clone());
            } else {
                warn!(path = entry.path.as_str(), "restore failed, content missing");
                skipped.push(entry.path.clone());
            }
        }

        info!(
            snapshot = snapshot.metadata.id,
            restored = restored.len(),
            skipped = skipped.len(),
            "restore complete"
        );

        Ok(RestoreReport {
            restored: restored.len(),
            skipped: skipped.len(),
            total: selected.len(),
            files_restored: restored,
            files_skipped: skipped,
        })
    }

    // ── export ─────────────────────────────────────────────────────

    /// Export snapshot files to a folder or a gzip-compressed tar archive
    pub fn export(
        &self,
        snapshot_ref: &str,
        output_path: &Path,
        archive: bool,
        file_filters: Option<&[String]>,
    ) -> Result<ExportReport> {
        let snapshot = self.require_snapshot(snapshot_ref)?;
        let selected = match file_filters {
            Some(filters) if !filters.is_empty() => snapshot.files_matching(filters),
            _ => snapshot.files.clone(),
        };

        if archive {
            self.export_archive(&snapshot, &selected, output_path)
        } else {
            self.export_folder(&snapshot, &selected, output_path)
        }
    }

    fn export_folder(
        &self,
        snapshot: &Snapshot,
        files: &[FileEntry],
        output_path: &Path,
    ) -> Result<ExportReport> {
        fs::create_dir_all(output_path)?;
        let mut exported = Vec::new();
        let mut failed = Vec::new();

        for entry in files {
            let target = output_path.join(&entry.path);
            if self.store.restore_file(&entry.hash, &target, entry.mode)? {
                exported.push(entry.path.clone());
            } else {
                failed.push(entry.path.clone());
            }
        }

        Ok(ExportReport {
            snapshot: snapshot.metadata.label(),
            format: "folder".to_string(),
            output_path: output_path.display().to_string(),
            exported: exported.len(),
            failed: failed.len(),
            archive_size: 0,
            files_exported: exported,
            files_failed: failed,
        })
    }

    fn export_archive(
        &self,
        snapshot: &Snapshot,
        files: &[FileEntry],
        output_path: &Path,
    ) -> Result<ExportReport> {
        let output_path = force_tar_gz_suffix(output_path);
        if let Some(parent) = output_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut exported = Vec::new();
        let mut failed = Vec::new();
        let mtime = snapshot.metadata.created_at.timestamp().max(0) as u64;

        let file = File::create(&output_path)?;
        let encoder = GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);

        for entry in files {
            match self.store.content_as_bytes(&entry.hash)? {
                Some(bytes) => {
                    let mut header = tar::Header::new_gnu();
                    header.set_size(bytes.len() as u64);
                    header.set_mode(entry.mode);
                    header.set_mtime(mtime);
                    header.set_cksum();
                    builder.append_data(&mut header, &entry.path, bytes.as_slice())?;
                    exported.push(entry.path.clone());
                }
                None => failed.push(entry.path.clone()),
            }
        }

        let encoder = builder.into_inner()?;
        encoder.finish()?;

        let archive_size = fs::metadata(&output_path).map(|m| m.len()).unwrap_or(0);
        debug!(
            archive = %output_path.display(),
            files = exported.len(),
            bytes = archive_size,
            "wrote archive export"
        );

        Ok(ExportReport {
            snapshot: snapshot.metadata.label(),
            format: "tar.gz".to_string(),
            output_path: output_path.display().to_string(),
            exported: exported.len(),
            failed: failed.len(),
            archive_size,
            files_exported: exported,
            files_failed: failed,
        })
    }

    // ── diff ───────────────────────────────────────────────────────

    /// Diff two snapshots, or a snapshot against the live working tree
    /// when `to_ref` is `"current"`
    pub fn diff(
        &self,
        from_ref: &str,
        to_ref: &str,
        file_filters: Option<&[String]>,
    ) -> Result<SnapshotDiff> {
        let from = self.require_snapshot(from_ref)?;

        let (to_id, to_files) = if to_ref == CURRENT_REF {
            (0, self.scanner.scan(None, None, false)?)
        } else {
            let to = self.require_snapshot(to_ref)?;
            (to.metadata.id, to.files)
        };

        let diff = SnapshotDiff::compute(from.metadata.id, to_id, &from.files, &to_files);

        Ok(match file_filters {
            Some(filters) if !filters.is_empty() => diff.filter_by_paths(filters),
            _ => diff,
        })
    }

    /// Render a diff in the requested format
    ///
    /// Unified and AST formats resolve the modified files' text: the from
    /// side from stored content, the to side from stored content or, when
    /// the diff targets the working tree, straight from disk.
    pub fn render_diff(&self, diff: &SnapshotDiff, format: DiffFormat) -> Result<String> {
        match format {
            DiffFormat::Json => Ok(serde_json::to_string_pretty(diff)?),
            DiffFormat::Markdown => Ok(diff::render_markdown(diff)),
            DiffFormat::Unified => {
                let texts = self.modified_texts(diff)?;
                Ok(diff::render_unified(diff, &texts, self.unified_context))
            }
            DiffFormat::Ast => {
                let texts = self.modified_texts(diff)?;
                Ok(diff::render_ast(diff, &texts, self.unified_context))
            }
        }
    }

    fn modified_texts(&self, diff: &SnapshotDiff) -> Result<Vec<ModifiedFileText>> {
        let to_is_current = diff.to_snapshot == 0;
        let mut texts = Vec::with_capacity(diff.files_modified.len());
        for entry in &diff.files_modified {
            let old_text = self.store.content_as_text(&entry.old_hash)?;
            let new_text = if to_is_current {
                fs::read(self.project_path.join(&entry.path))
                    .ok()
                    .and_then(|bytes| String::from_utf8(bytes).ok())
            } else {
                self.store.content_as_text(&entry.new_hash)?
            };
            texts.push(ModifiedFileText {
                path: entry.path.clone(),
                old_text,
                new_text,
            });
        }
        Ok(texts)
    }

    // ── history ────────────────────────────────────────────────────

    /// A file's chronological history across all snapshots
    ///
    /// Walks snapshots in ascending id order, emitting an entry when the
    /// file is present (added, modified or unchanged against its previous
    /// in-scope hash) and when a previously present file disappears.
    pub fn file_history(&self, file_path: &str) -> Result<Vec<FileHistoryEntry>> {
        let mut history = Vec::new();
        let mut previous_hash: Option<String> = None;

        for metadata in self.db.list_snapshots_ascending()? {
            let files = self.db.snapshot_files(metadata.id)?;
            match files.iter().find(|f| f.path == file_path) {
                Some(entry) => {
                    let status = match &previous_hash {
                        None => HistoryStatus::Added,
                        Some(prev) if *prev != entry.hash => HistoryStatus::Modified,
                        Some(_) => HistoryStatus::Unchanged,
                    };
                    history.push(FileHistoryEntry {
                        snapshot_id: metadata.id,
                        tag: metadata.tag.clone(),
                        created_at: metadata.created_at,
                        status,
                        hash: Some(entry.hash.clone()),
                        size: Some(entry.size),
                    });
                    previous_hash = Some(entry.hash.clone());
                }
                None if previous_hash.is_some() => {
                    history.push(FileHistoryEntry {
                        snapshot_id: metadata.id,
                        tag: metadata.tag.clone(),
                        created_at: metadata.created_at,
                        status: HistoryStatus::Removed,
                        hash: None,
                        size: None,
                    });
                    previous_hash = None;
                }
                None => {}
            }
        }

        Ok(history)
    }

    // ── search ─────────────────────────────────────────────────────

    /// Search stored file content for a substring
    ///
    /// Walks the referenced snapshot, or all non-autosave snapshots when
    /// no reference is given, decompressing each unique content hash at
    /// most once. Results are capped at 50 files with the first 5 matching
    /// lines each.
    pub fn search(
        &self,
        query: &str,
        file_filter: Option<&str>,
        snapshot_ref: Option<&str>,
        case_sensitive: bool,
    ) -> Result<Vec<FileSearchResult>> {
        let snapshots: Vec<Snapshot> = match snapshot_ref {
            Some(r) => vec![self.require_snapshot(r)?],
            None => {
                let mut snaps = Vec::new();
                for metadata in self.db.list_snapshots(None, false)? {
                    let files = self.db.snapshot_files(metadata.id)?;
                    snaps.push(Snapshot { metadata, files });
                }
                snaps
            }
        };

        let filter_glob = match file_filter {
            Some(pattern) => Some(
                globset::Glob::new(pattern)
                    .map_err(|e| SnapError::invalid(format!("bad glob '{}': {}", pattern, e)))?
                    .compile_matcher(),
            ),
            None => None,
        };

        let needle = if case_sensitive {
            query.to_string()
        } else {
            query.to_lowercase()
        };

        let mut seen_hashes: HashSet<String> = HashSet::new();
        let mut results = Vec::new();

        'snapshots: for snapshot in &snapshots {
            for entry in &snapshot.files {
                if let Some(glob) = &filter_glob {
                    if !glob.is_match(&entry.path) {
                        continue;
                    }
                }
                if !seen_hashes.insert(entry.hash.clone()) {
                    continue;
                }

                let Some(text) = self.store.content_as_text(&entry.hash)? else {
                    continue;
                };

                let mut matches = Vec::new();
                let mut total_matches = 0;
                for (line_idx, line) in text.lines().enumerate() {
                    let haystack = if case_sensitive {
                        line.to_string()
                    } else {
                        line.to_lowercase()
                    };
                    let count = haystack.matches(needle.as_str()).count();
                    if count > 0 {
                        total_matches += count;
                        if matches.len() < SEARCH_LINE_CAP {
                            matches.push(SearchMatch {
                                line_number: line_idx + 1,
                                line: line.trim().to_string(),
                            });
                        }
                    }
                }

                if total_matches > 0 {
                    results.push(FileSearchResult {
                        snapshot_id: snapshot.metadata.id,
                        snapshot_label: snapshot.metadata.label(),
                        path: entry.path.clone(),
                        matches,
                        total_matches,
                    });
                    if results.len() >= SEARCH_FILE_CAP {
                        break 'snapshots;
                    }
                }
            }
        }

        Ok(results)
    }

    // ── changelog ──────────────────────────────────────────────────

    /// Keep-a-Changelog style Markdown between two references
    pub fn changelog(&self, from_ref: &str, to_ref: Option<&str>) -> Result<String> {
        let to_ref = to_ref.unwrap_or(CURRENT_REF);
        let diff = self.diff(from_ref, to_ref, None)?;

        let from_label = self.require_snapshot(from_ref)?.metadata.label();
        let (to_label, to_date) = if to_ref == CURRENT_REF {
            (CURRENT_REF.to_string(), Utc::now())
        } else {
            let to = self.require_snapshot(to_ref)?;
            (to.metadata.label(), to.metadata.created_at)
        };

        Ok(diff::render_changelog(&diff, &from_label, &to_label, to_date))
    }

    // ── cleanup ────────────────────────────────────────────────────

    /// Delete autosave snapshots beyond the newest `max_keep`
    pub fn cleanup_old_autosaves(&self, max_keep: usize) -> Result<usize> {
        self.db.cleanup_old_autosaves(max_keep)
    }

    /// Delete autosave snapshots older than `days`
    pub fn cleanup_expired_autosaves(&self, days: u32) -> Result<usize> {
        self.db.cleanup_expired_autosaves(days)
    }

    /// Delete content blobs no snapshot references
    pub fn cleanup_orphaned_contents(&self) -> Result<usize> {
        self.db.cleanup_orphaned_contents()
    }
}

/// Deterministic snapshot hash: SHA-256 over (path, content-hash) pairs
/// sorted by path
pub fn snapshot_hash(files: &[FileEntry]) -> String {
    let mut sorted: Vec<(&str, &str)> = files
        .iter()
        .map(|f| (f.path.as_str(), f.hash.as_str()))
        .collect();
    sorted.sort();

    let mut hasher = Sha256::new();
    for (path, hash) in sorted {
        hasher.update(path.as_bytes());
        hasher.update(hash.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Force a `.tar.gz` suffix, replacing whatever extension is present
fn force_tar_gz_suffix(path: &Path) -> PathBuf {
    if path.to_string_lossy().ends_with(".tar.gz") {
        return path.to_path_buf();
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "export".to_string());
    path.with_file_name(format!("{}.tar.gz", stem))
}
