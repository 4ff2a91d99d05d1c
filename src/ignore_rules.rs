//! Ignore rules and the pruning directory walk
//!
//! Four concept-level rule sets decide what the scanner never sees:
//! directory base-names (ignored as whole subtrees), file base-names,
//! lower-case dot-prefixed extensions, and gitignore-style patterns
//! evaluated against the project-relative path. The storage directory is
//! always ignored so the engine never snapshots its own database.
//!
//! Ignored directories are pruned during the walk, not filtered after the
//! fact: nothing below them is ever visited.

use crate::error::Result;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use ignore::WalkBuilder;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::trace;

struct Rules {
    dirs: HashSet<String>,
    files: HashSet<String>,
    extensions: HashSet<String>,
    gitignore: Gitignore,
    storage_dir: String,
}

/// Decides whether a path is ignored for this project
#[derive(Clone)]
pub struct IgnoreFilter {
    rules: Arc<Rules>,
    root: PathBuf,
}

impl std::fmt::Debug for IgnoreFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IgnoreFilter")
            .field("root", &self.root)
            .field("dirs", &self.rules.dirs.len())
            .field("files", &self.rules.files.len())
            .field("extensions", &self.rules.extensions.len())
            .finish()
    }
}

impl IgnoreFilter {
    /// Build a filter for `root` from the four rule sets
    ///
    /// `extensions` are normalized to lower-case dot-prefixed form;
    /// `patterns` use gitignore syntax relative to the project root.
    pub fn new(
        root: &Path,
        dirs: &[String],
        files: &[String],
        extensions: &[String],
        patterns: &[String],
        storage_dir: &str,
    ) -> Result<Self> {
        let mut builder = GitignoreBuilder::new(root);
        for pattern in patterns {
            // An unparseable pattern is a config mistake, not a reason to
            // fail every scan
            let _ = builder.add_line(None, pattern);
        }
        let gitignore = builder
            .build()
            .unwrap_or_else(|_| Gitignore::empty());

        let extensions = extensions
            .iter()
            .map(|e| {
                let e = e.to_lowercase();
                if e.starts_with('.') {
                    e
                } else {
                    format!(".{}", e)
                }
            })
            .collect();

        // The engine never tracks its own config file
        let mut files: HashSet<String> = files.iter().cloned().collect();
        files.insert(crate::config::CONFIG_FILE_NAME.to_string());

        Ok(Self {
            rules: Arc::new(Rules {
                dirs: dirs.iter().cloned().collect(),
                files,
                extensions,
                gitignore,
                storage_dir: storage_dir.to_string(),
            }),
            root: root.to_path_buf(),
        })
    }

    /// Whether `path` (absolute or project-relative) should be ignored
    pub fn should_ignore(&self, path: &Path, is_dir: bool) -> bool {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);

        // Any ignored directory name in the path kills the whole subtree
        for component in relative.components() {
            let name = component.as_os_str().to_string_lossy();
            if name == self.rules.storage_dir || self.rules.dirs.contains(name.as_ref()) {
                return true;
            }
        }

        if !is_dir {
            if let Some(name) = relative.file_name() {
                if self.rules.files.contains(name.to_string_lossy().as_ref()) {
                    return true;
                }
            }
            if let Some(ext) = relative.extension() {
                let dotted = format!(".{}", ext.to_string_lossy().to_lowercase());
                if self.rules.extensions.contains(&dotted) {
                    return true;
                }
            }
        }

        if self
            .rules
            .gitignore
            .matched(relative, is_dir)
            .is_ignore()
        {
            trace!(path = %relative.display(), "ignored by pattern");
            return true;
        }

        false
    }

    /// Walk `root` depth-first, yielding kept regular files
    ///
    /// Ignored directories are pruned so their contents are never visited;
    /// unreadable directories are skipped silently.
    pub fn scan_directory(&self, root: &Path) -> Vec<PathBuf> {
        let filter = self.clone();
        let walk = WalkBuilder::new(root)
            .standard_filters(false)
            .hidden(false)
            .follow_links(false)
            .filter_entry(move |entry| {
                let is_dir = entry
                    .file_type()
                    .map(|t| t.is_dir())
                    .unwrap_or(false);
                !filter.should_ignore(entry.path(), is_dir)
            })
            .build();

        let mut kept = Vec::new();
        for entry in walk {
            let Ok(entry) = entry else {
                // Unreadable directory or racing deletion
                continue;
            };
            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            if is_file {
                kept.push(entry.into_path());
            }
        }
        kept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn filter(root: &Path) -> IgnoreFilter {
        IgnoreFilter::new(
            root,
            &["node_modules".to_string(), ".git".to_string()],
            &[".DS_Store".to_string()],
            &[".pyc".to_string()],
            &["*.log".to_string()],
            ".gencodedoc",
        )
        .unwrap()
    }

    #[test]
    fn test_directory_rule_ignores_subtree() {
        let dir = TempDir::new().unwrap();
        let f = filter(dir.path());

        assert!(f.should_ignore(&dir.path().join("node_modules"), true));
        assert!(f.should_ignore(&dir.path().join("node_modules/deep/pkg/index.js"), false));
        assert!(!f.should_ignore(&dir.path().join("src"), true));
    }

    #[test]
    fn test_file_and_extension_rules() {
        let dir = TempDir::new().unwrap();
        let f = filter(dir.path());

        assert!(f.should_ignore(&dir.path().join("sub/.DS_Store"), false));
        assert!(f.should_ignore(&dir.path().join("app/cache.pyc"), false));
        assert!(f.should_ignore(&dir.path().join("app/CACHE.PYC"), false));
        assert!(!f.should_ignore(&dir.path().join("app/main.py"), false));
    }

    #[test]
    fn test_pattern_rule() {
        let dir = TempDir::new().unwrap();
        let f = filter(dir.path());

        assert!(f.should_ignore(&dir.path().join("debug.log"), false));
        assert!(f.should_ignore(&dir.path().join("logs/server.log"), false));
        assert!(!f.should_ignore(&dir.path().join("debug.txt"), false));
    }

    #[test]
    fn test_storage_dir_always_ignored() {
        let dir = TempDir::new().unwrap();
        let f = filter(dir.path());
        assert!(f.should_ignore(&dir.path().join(".gencodedoc"), true));
        assert!(f.should_ignore(&dir.path().join(".gencodedoc/gencodedoc.db"), false));
    }

    #[test]
    fn test_scan_prunes_ignored_directories() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("keep.txt"), "k").unwrap();
        fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        fs::write(dir.path().join("node_modules/pkg/index.js"), "x").unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/main.rs"), "fn main() {}").unwrap();
        fs::write(dir.path().join("src/trace.log"), "noise").unwrap();

        let f = filter(dir.path());
        let mut names: Vec<String> = f
            .scan_directory(dir.path())
            .into_iter()
            .map(|p| {
                p.strip_prefix(dir.path())
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        names.sort();

        assert_eq!(names, vec!["keep.txt", "src/main.rs"]);
    }
}
