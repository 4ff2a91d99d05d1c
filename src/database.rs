//! SQLite-backed metadata store
//!
//! Holds everything durable about a project: snapshot metadata, per-snapshot
//! file links, content blobs and the autosave bookkeeping row, all in one
//! `gencodedoc.db` file under the project's storage directory.
//!
//! The connection sits behind a mutex, so there is a single logical writer
//! at a time. Snapshot creation runs inside one transaction: the metadata
//! row, every file link and every newly persisted blob commit together or
//! not at all. Unique-constraint violations on the snapshot hash and tag
//! columns are mapped to the distinguished [`SnapError::NoChanges`] and
//! [`SnapError::DuplicateTag`] kinds.

use crate::error::{Result, SnapError};
use crate::types::{AutosaveState, FileEntry, SnapshotMetadata};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Durable keyed store for snapshots, file links, content blobs and
/// autosave state
pub struct MetadataDB {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for MetadataDB {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataDB").finish_non_exhaustive()
    }
}

/// Fields of a snapshot row known before the file loop runs
#[derive(Debug, Clone)]
pub struct NewSnapshot {
    /// Deterministic snapshot hash
    pub hash: String,
    /// Optional human message
    pub message: Option<String>,
    /// Optional unique tag
    pub tag: Option<String>,
    /// Latest snapshot id at creation time
    pub parent_id: Option<i64>,
    /// Whether the autosave loop is creating this snapshot
    pub is_autosave: bool,
    /// Trigger label
    pub trigger_type: String,
    /// Number of files being recorded
    pub files_count: usize,
    /// Uncompressed total size
    pub total_size: u64,
}

impl MetadataDB {
    /// Open (and create if needed) the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                hash TEXT NOT NULL UNIQUE,
                message TEXT,
                tag TEXT UNIQUE,
                created_at TEXT NOT NULL,
                parent_id INTEGER REFERENCES snapshots(id),
                is_autosave INTEGER NOT NULL DEFAULT 0,
                trigger_type TEXT NOT NULL DEFAULT 'manual',
                files_count INTEGER NOT NULL DEFAULT 0,
                total_size INTEGER NOT NULL DEFAULT 0,
                compressed_size INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS snapshot_files (
                snapshot_id INTEGER NOT NULL REFERENCES snapshots(id),
                file_path TEXT NOT NULL,
                file_hash TEXT NOT NULL,
                size INTEGER NOT NULL,
                mode INTEGER NOT NULL DEFAULT 420,
                UNIQUE(snapshot_id, file_path)
            );

            CREATE TABLE IF NOT EXISTS file_contents (
                hash TEXT PRIMARY KEY,
                content BLOB NOT NULL,
                original_size INTEGER NOT NULL,
                compressed_size INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS autosave_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                last_check TEXT,
                last_save TEXT,
                last_snapshot_id INTEGER,
                files_tracked INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_snapshots_created
                ON snapshots(created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_snapshots_tag
                ON snapshots(tag);
            CREATE INDEX IF NOT EXISTS idx_snapshot_files_hash
                ON snapshot_files(file_hash);",
        )?;

        info!("Opened metadata store at {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` inside a write transaction, committing on Ok and rolling
    /// back on Err
    pub fn with_tx<T>(&self, f: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    // ── snapshot rows ──────────────────────────────────────────────

    /// Insert the snapshot metadata row, mapping unique-constraint hits on
    /// the hash and tag columns to their distinguished error kinds
    pub fn insert_snapshot(tx: &Transaction, new: &NewSnapshot) -> Result<i64> {
        let result = tx.execute(
            "INSERT INTO snapshots
             (hash, message, tag, created_at, parent_id, is_autosave,
              trigger_type, files_count, total_size, compressed_size)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0)",
            params![
                new.hash,
                new.message,
                new.tag,
                Utc::now().to_rfc3339(),
                new.parent_id,
                new.is_autosave,
                new.trigger_type,
                new.files_count as i64,
                new.total_size as i64,
            ],
        );

        match result {
            Ok(_) => Ok(tx.last_insert_rowid()),
            Err(err) => Err(map_unique_violation(err, new)),
        }
    }

    /// Record the storage cost of blobs first persisted by this creation
    pub fn set_compressed_size(tx: &Transaction, snapshot_id: i64, compressed: u64) -> Result<()> {
        tx.execute(
            "UPDATE snapshots SET compressed_size = ?1 WHERE id = ?2",
            params![compressed as i64, snapshot_id],
        )?;
        Ok(())
    }

    /// Link a file entry to a snapshot
    pub fn add_file(tx: &Transaction, snapshot_id: i64, entry: &FileEntry) -> Result<()> {
        tx.execute(
            "INSERT INTO snapshot_files (snapshot_id, file_path, file_hash, size, mode)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                snapshot_id,
                entry.path,
                entry.hash,
                entry.size as i64,
                entry.mode,
            ],
        )?;
        Ok(())
    }

    /// Fetch snapshot metadata by id
    pub fn get_snapshot(&self, id: i64) -> Result<Option<SnapshotMetadata>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM snapshots WHERE id = ?1", META_COLUMNS),
            params![id],
            row_to_metadata,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Fetch snapshot metadata by tag
    pub fn get_snapshot_by_tag(&self, tag: &str) -> Result<Option<SnapshotMetadata>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM snapshots WHERE tag = ?1", META_COLUMNS),
            params![tag],
            row_to_metadata,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Latest snapshot by creation time, autosaves included
    pub fn get_latest_snapshot(&self) -> Result<Option<SnapshotMetadata>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "SELECT {} FROM snapshots ORDER BY created_at DESC, id DESC LIMIT 1",
                META_COLUMNS
            ),
            [],
            row_to_metadata,
        )
        .optional()
        .map_err(Into::into)
    }

    /// List snapshots newest-first with an optional limit and an optional
    /// autosave filter
    pub fn list_snapshots(
        &self,
        limit: Option<usize>,
        include_autosave: bool,
    ) -> Result<Vec<SnapshotMetadata>> {
        let conn = self.conn.lock();
        let filter = if include_autosave {
            ""
        } else {
            "WHERE is_autosave = 0"
        };
        let sql = format!(
            "SELECT {} FROM snapshots {} ORDER BY created_at DESC, id DESC LIMIT ?1",
            META_COLUMNS, filter
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![limit.map(|l| l as i64).unwrap_or(-1)], row_to_metadata)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// All snapshot metadata in ascending id order, for history walks
    pub fn list_snapshots_ascending(&self) -> Result<Vec<SnapshotMetadata>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM snapshots ORDER BY id ASC", META_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], row_to_metadata)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Delete a snapshot and its file-link rows atomically
    ///
    /// Returns false when no snapshot with that id existed. Content blobs
    /// are left alone; they are reclaimed only by
    /// [`MetadataDB::cleanup_orphaned_contents`].
    pub fn delete_snapshot(&self, id: i64) -> Result<bool> {
        self.with_tx(|tx| {
            tx.execute(
                "DELETE FROM snapshot_files WHERE snapshot_id = ?1",
                params![id],
            )?;
            let deleted = tx.execute("DELETE FROM snapshots WHERE id = ?1", params![id])?;
            Ok(deleted > 0)
        })
    }

    /// File entries recorded by one snapshot, in insertion order
    pub fn snapshot_files(&self, snapshot_id: i64) -> Result<Vec<FileEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT file_path, file_hash, size, mode
             FROM snapshot_files WHERE snapshot_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt
            .query_map(params![snapshot_id], |row| {
                Ok(FileEntry {
                    path: row.get(0)?,
                    hash: row.get(1)?,
                    size: row.get::<_, i64>(2)? as u64,
                    mode: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── content blobs ──────────────────────────────────────────────

    /// Persist a content blob, doing nothing when the hash already exists
    pub fn insert_content(
        tx: &Transaction,
        hash: &str,
        content: &[u8],
        original_size: u64,
        stored_size: u64,
    ) -> Result<bool> {
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO file_contents
             (hash, content, original_size, compressed_size, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                hash,
                content,
                original_size as i64,
                stored_size as i64,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(inserted > 0)
    }

    /// Whether a blob with this hash is already stored (transaction scope)
    pub fn content_exists_tx(tx: &Transaction, hash: &str) -> Result<bool> {
        let found: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM file_contents WHERE hash = ?1",
                params![hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Whether a blob with this hash is already stored
    pub fn content_exists(&self, hash: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM file_contents WHERE hash = ?1",
                params![hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Read the stored bytes for a content hash
    pub fn get_content(&self, hash: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT content FROM file_contents WHERE hash = ?1",
            params![hash],
            |row| row.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    // ── autosave state and retention ───────────────────────────────

    /// Read the autosave bookkeeping row, defaulting when absent
    pub fn autosave_state(&self) -> Result<AutosaveState> {
        let conn = self.conn.lock();
        let state = conn
            .query_row(
                "SELECT last_check, last_save, last_snapshot_id, files_tracked
                 FROM autosave_state WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;

        match state {
            Some((check, save, id, tracked)) => Ok(AutosaveState {
                last_check: check.as_deref().and_then(parse_timestamp),
                last_save: save.as_deref().and_then(parse_timestamp),
                last_snapshot_id: id,
                files_tracked: tracked as usize,
            }),
            None => Ok(AutosaveState {
                last_check: None,
                last_save: None,
                last_snapshot_id: None,
                files_tracked: 0,
            }),
        }
    }

    /// Create or update the singleton autosave row in place
    pub fn update_autosave_state(&self, state: &AutosaveState) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO autosave_state (id, last_check, last_save, last_snapshot_id, files_tracked)
             VALUES (1, ?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                last_check = excluded.last_check,
                last_save = excluded.last_save,
                last_snapshot_id = excluded.last_snapshot_id,
                files_tracked = excluded.files_tracked",
            params![
                state.last_check.map(|t| t.to_rfc3339()),
                state.last_save.map(|t| t.to_rfc3339()),
                state.last_snapshot_id,
                state.files_tracked as i64,
            ],
        )?;
        Ok(())
    }

    /// Delete autosave snapshots beyond the newest `max_keep`
    pub fn cleanup_old_autosaves(&self, max_keep: usize) -> Result<usize> {
        self.with_tx(|tx| {
            tx.execute(
                "DELETE FROM snapshot_files WHERE snapshot_id IN (
                    SELECT id FROM snapshots WHERE is_autosave = 1
                    AND id NOT IN (
                        SELECT id FROM snapshots WHERE is_autosave = 1
                        ORDER BY created_at DESC, id DESC LIMIT ?1
                    )
                )",
                params![max_keep as i64],
            )?;
            let deleted = tx.execute(
                "DELETE FROM snapshots WHERE is_autosave = 1
                 AND id NOT IN (
                    SELECT id FROM snapshots WHERE is_autosave = 1
                    ORDER BY created_at DESC, id DESC LIMIT ?1
                 )",
                params![max_keep as i64],
            )?;
            if deleted > 0 {
                debug!(deleted, max_keep, "pruned old autosaves");
            }
            Ok(deleted)
        })
    }

    /// Delete autosave snapshots older than `days`
    pub fn cleanup_expired_autosaves(&self, days: u32) -> Result<usize> {
        let cutoff = (Utc::now() - Duration::days(days as i64)).to_rfc3339();
        self.with_tx(|tx| {
            tx.execute(
                "DELETE FROM snapshot_files WHERE snapshot_id IN (
                    SELECT id FROM snapshots WHERE is_autosave = 1 AND created_at < ?1
                )",
                params![cutoff],
            )?;
            let deleted = tx.execute(
                "DELETE FROM snapshots WHERE is_autosave = 1 AND created_at < ?1",
                params![cutoff],
            )?;
            if deleted > 0 {
                debug!(deleted, days, "pruned expired autosaves");
            }
            Ok(deleted)
        })
    }

    /// Delete content rows no snapshot references, returning the row count
    pub fn cleanup_orphaned_contents(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM file_contents WHERE hash NOT IN (
                SELECT DISTINCT file_hash FROM snapshot_files
            )",
            [],
        )?;
        if deleted > 0 {
            info!(deleted, "garbage-collected orphaned content blobs");
        }
        Ok(deleted)
    }

    // ── status counters ────────────────────────────────────────────

    /// (total snapshots, autosave snapshots)
    pub fn snapshot_counts(&self) -> Result<(usize, usize)> {
        let conn = self.conn.lock();
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM snapshots", [], |r| r.get(0))?;
        let autosaves: i64 = conn.query_row(
            "SELECT COUNT(*) FROM snapshots WHERE is_autosave = 1",
            [],
            |r| r.get(0),
        )?;
        Ok((total as usize, autosaves as usize))
    }

    /// (content blob rows, stored bytes total)
    pub fn content_stats(&self) -> Result<(usize, u64)> {
        let conn = self.conn.lock();
        let (count, bytes): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(compressed_size), 0) FROM file_contents",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        Ok((count as usize, bytes as u64))
    }
}

const META_COLUMNS: &str = "id, hash, message, tag, created_at, parent_id, \
                            is_autosave, trigger_type, files_count, total_size, compressed_size";

fn row_to_metadata(row: &rusqlite::Row<'_>) -> rusqlite::Result<SnapshotMetadata> {
    let created_raw: String = row.get(4)?;
    let created_at = parse_timestamp(&created_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("bad timestamp: {}", created_raw).into(),
        )
    })?;

    Ok(SnapshotMetadata {
        id: row.get(0)?,
        hash: row.get(1)?,
        message: row.get(2)?,
        tag: row.get(3)?,
        created_at,
        parent_id: row.get(5)?,
        is_autosave: row.get(6)?,
        trigger_type: row.get(7)?,
        files_count: row.get::<_, i64>(8)? as usize,
        total_size: row.get::<_, i64>(9)? as u64,
        compressed_size: row.get::<_, i64>(10)? as u64,
    })
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Map a unique-constraint failure on insert to its distinguished kind
fn map_unique_violation(err: rusqlite::Error, new: &NewSnapshot) -> SnapError {
    if let rusqlite::Error::SqliteFailure(code, Some(msg)) = &err {
        if code.code == rusqlite::ErrorCode::ConstraintViolation {
            if msg.contains("snapshots.hash") {
                return SnapError::NoChanges;
            }
            if msg.contains("snapshots.tag") {
                return SnapError::DuplicateTag(new.tag.clone().unwrap_or_default());
            }
        }
    }
    SnapError::Sql(err)
}
