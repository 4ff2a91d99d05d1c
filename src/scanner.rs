//! Working-tree scanner
//!
//! Walks the project through the [`IgnoreFilter`], sniffs out binary
//! content when asked to, and emits one [`FileEntry`] per kept file with
//! its streaming SHA-256, size and mode bits. Per-file failures are logged
//! and skipped; they never fail the scan.

use crate::error::Result;
use crate::ignore_rules::IgnoreFilter;
use crate::types::FileEntry;
use crate::utils;
use rayon::prelude::*;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// How much of a file the binary sniffer inspects
const SNIFF_WINDOW: usize = 8 * 1024;
/// A file is binary when more than this fraction of the window is non-text
const BINARY_THRESHOLD: f64 = 0.30;

/// Produces the tree of tracked files for snapshot creation and diffing
#[derive(Debug, Clone)]
pub struct Scanner {
    root: PathBuf,
    filter: IgnoreFilter,
}

impl Scanner {
    /// Create a scanner rooted at the project directory
    pub fn new(root: PathBuf, filter: IgnoreFilter) -> Self {
        Self { root, filter }
    }

    /// Project root this scanner walks
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scan the working tree into an ordered list of file entries
    ///
    /// With `include_paths`, only the named files or directories are
    /// visited (still filtered through the ignore rules); otherwise the
    /// whole project root is walked. `exclude_paths` removes exact
    /// project-relative matches after the walk. With `include_binary`
    /// false, files that sniff as binary are dropped.
    pub fn scan(
        &self,
        include_paths: Option<&[String]>,
        exclude_paths: Option<&[String]>,
        include_binary: bool,
    ) -> Result<Vec<FileEntry>> {
        let candidates = match include_paths {
            Some(paths) if !paths.is_empty() => self.collect_included(paths),
            _ => self.filter.scan_directory(&self.root),
        };

        let mut entries: Vec<FileEntry> = candidates
            .par_iter()
            .filter_map(|path| self.entry_for(path, include_binary))
            .collect();

        if let Some(excludes) = exclude_paths {
            if !excludes.is_empty() {
                entries.retain(|e| !excludes.iter().any(|x| x == &e.path));
            }
        }

        // Deterministic emitted order regardless of walk and rayon timing;
        // overlapping include paths must not emit a path twice
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        entries.dedup_by(|a, b| a.path == b.path);

        debug!(files = entries.len(), "scan complete");
        Ok(entries)
    }

    fn collect_included(&self, paths: &[String]) -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        for raw in paths {
            let absolute = {
                let p = Path::new(raw);
                if p.is_absolute() {
                    p.to_path_buf()
                } else {
                    self.root.join(p)
                }
            };

            if absolute.is_dir() {
                if !self.filter.should_ignore(&absolute, true) {
                    candidates.extend(self.filter.scan_directory(&absolute));
                }
            } else if absolute.is_file() {
                if !self.filter.should_ignore(&absolute, false) {
                    candidates.push(absolute);
                }
            } else {
                warn!(path = raw.as_str(), "included path does not exist, skipping");
            }
        }
        candidates
    }

    fn entry_for(&self, path: &Path, include_binary: bool) -> Option<FileEntry> {
        let relative = utils::relative_slash_path(path, &self.root)?;

        let metadata = match path.metadata() {
            Ok(m) => m,
            Err(err) => {
                warn!(path = %path.display(), %err, "cannot stat file, skipping");
                return None;
            }
        };

        if !include_binary {
            match sniff_binary(path) {
                Ok(true) => return None,
                Ok(false) => {}
                Err(err) => {
                    warn!(path = %path.display(), %err, "cannot read file, skipping");
                    return None;
                }
            }
        }

        let hash = match utils::hash_file_content(path) {
            Ok(h) => h,
            Err(err) => {
                warn!(path = %path.display(), %err, "cannot hash file, skipping");
                return None;
            }
        };

        Some(FileEntry {
            path: relative,
            hash,
            size: metadata.len(),
            mode: utils::file_mode(&metadata),
        })
    }
}

/// Whether the first 8 KiB of the file look like binary content
///
/// Binary means a NUL byte anywhere in the window, or more than 30% of the
/// window outside the text-character set (tab, newline, carriage return,
/// form feed, backspace, bell, escape, and 0x20-0xFF except DEL).
fn sniff_binary(path: &Path) -> std::io::Result<bool> {
    let mut file = File::open(path)?;
    let mut window = [0u8; SNIFF_WINDOW];
    let mut filled = 0;
    while filled < SNIFF_WINDOW {
        let n = file.read(&mut window[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    let window = &window[..filled];

    if window.is_empty() {
        return Ok(false);
    }
    if window.contains(&0) {
        return Ok(true);
    }

    let non_text = window.iter().filter(|&&b| !is_text_byte(b)).count();
    Ok(non_text as f64 / window.len() as f64 > BINARY_THRESHOLD)
}

fn is_text_byte(byte: u8) -> bool {
    matches!(byte, 0x07 | 0x08 | 0x09 | 0x0A | 0x0C | 0x0D | 0x1B)
        || (0x20..=0xFF).contains(&byte) && byte != 0x7F
}
