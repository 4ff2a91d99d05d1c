//! Project configuration
//!
//! Configuration lives in `.gencodedoc.yaml` at the project root, deep-
//! merged over an optional global file under
//! `~/.config/gencodedoc/config.yaml`. The schema covers ignore rules,
//! autosave policy, diff rendering and compression; everything has a
//! sensible default so a bare `init_project` call produces a working
//! setup.

use crate::error::{Result, SnapError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Project config file name
pub const CONFIG_FILE_NAME: &str = ".gencodedoc.yaml";
/// Default storage directory name
pub const DEFAULT_STORAGE_DIR: &str = ".gencodedoc";
/// Database file name inside the storage directory
pub const DATABASE_FILE_NAME: &str = "gencodedoc.db";

/// The four ignore rule sets
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IgnoreConfig {
    /// Directory base-names ignored as whole subtrees
    pub dirs: Vec<String>,
    /// File base-names
    pub files: Vec<String>,
    /// Lower-case dot-prefixed extensions
    pub extensions: Vec<String>,
    /// Gitignore-style patterns against the project-relative path
    pub patterns: Vec<String>,
}

impl IgnoreConfig {
    fn dedup(&mut self) {
        for list in [
            &mut self.dirs,
            &mut self.files,
            &mut self.extensions,
            &mut self.patterns,
        ] {
            let mut seen = std::collections::HashSet::new();
            list.retain(|item| seen.insert(item.clone()));
        }
    }
}

/// Autosave mode selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutosaveMode {
    /// Fixed-interval background snapshots
    Timer,
    /// Watcher-driven snapshots above a change-significance threshold
    Diff,
    /// Threshold snapshots bounded by a minimum and maximum interval
    Hybrid,
}

/// Timer mode settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimerConfig {
    /// Seconds between snapshots
    pub interval: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self { interval: 300 }
    }
}

/// Diff-threshold mode settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiffThresholdConfig {
    /// Minimum change significance that triggers a snapshot
    pub threshold: f64,
    /// Seconds between dirty-flag checks
    pub check_interval: u64,
    /// Whether whitespace-only line changes count (advisory)
    pub ignore_whitespace: bool,
    /// Whether comment-only line changes count (advisory)
    pub ignore_comments: bool,
}

impl Default for DiffThresholdConfig {
    fn default() -> Self {
        Self {
            threshold: 0.1,
            check_interval: 60,
            ignore_whitespace: false,
            ignore_comments: false,
        }
    }
}

/// Hybrid mode settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HybridConfig {
    /// No threshold snapshot sooner than this many seconds after the last
    pub min_interval: u64,
    /// Unconditional snapshot after this many seconds
    pub max_interval: u64,
    /// Minimum change significance for threshold snapshots
    pub threshold: f64,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            min_interval: 300,
            max_interval: 1800,
            threshold: 0.1,
        }
    }
}

/// Autosave retention policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetentionConfig {
    /// Autosave snapshots kept, newest first
    pub max_autosaves: usize,
    /// Stored but advisory; no recompression pass acts on it
    pub compress_after_days: u32,
    /// Autosaves older than this are deleted; zero disables
    pub delete_after_days: u32,
    /// Manual snapshots are never touched by retention
    pub keep_manual: bool,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_autosaves: 50,
            compress_after_days: 7,
            delete_after_days: 30,
            keep_manual: true,
        }
    }
}

/// Autosave policy block
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AutosaveConfig {
    /// Whether the loop starts with the project
    pub enabled: bool,
    /// Which mode the loop runs in
    pub mode: AutosaveMode,
    /// Timer mode settings
    pub timer: TimerConfig,
    /// Diff-threshold mode settings
    pub diff_threshold: DiffThresholdConfig,
    /// Hybrid mode settings
    pub hybrid: HybridConfig,
    /// Retention policy applied after every trigger
    pub retention: RetentionConfig,
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: AutosaveMode::Timer,
            timer: TimerConfig::default(),
            diff_threshold: DiffThresholdConfig::default(),
            hybrid: HybridConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

/// Diff rendering defaults
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiffFormatConfig {
    /// Default output format: unified, json, markdown or ast
    pub default: String,
    /// Context lines around unified hunks
    pub unified_context: usize,
    /// Whether JSON output embeds file content (advisory)
    pub json_include_content: bool,
    /// AST diffing toggle; falls back to unified for now
    pub ast_enabled: bool,
}

impl Default for DiffFormatConfig {
    fn default() -> Self {
        Self {
            default: "unified".to_string(),
            unified_context: 3,
            json_include_content: false,
            ast_enabled: false,
        }
    }
}

/// Complete per-project configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProjectConfig {
    /// Human name, defaults to the directory name
    pub project_name: String,
    /// Absolute project root; injected at load time, never serialized
    #[serde(skip)]
    pub project_path: PathBuf,
    /// Storage directory name under the project root
    pub storage_path: String,
    /// Ignore rules
    pub ignore: IgnoreConfig,
    /// Autosave policy
    pub autosave: AutosaveConfig,
    /// Diff rendering defaults
    pub diff_format: DiffFormatConfig,
    /// Whether new blobs are compressed at rest
    pub compression_enabled: bool,
    /// zstd level in [1, 22]
    pub compression_level: i32,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            project_name: String::new(),
            project_path: PathBuf::new(),
            storage_path: DEFAULT_STORAGE_DIR.to_string(),
            ignore: IgnoreConfig {
                dirs: vec![".git".to_string()],
                files: vec![".DS_Store".to_string(), "Thumbs.db".to_string()],
                extensions: Vec::new(),
                patterns: Vec::new(),
            },
            autosave: AutosaveConfig::default(),
            diff_format: DiffFormatConfig::default(),
            compression_enabled: true,
            compression_level: 3,
        }
    }
}

impl ProjectConfig {
    /// Default config bound to a project root
    pub fn for_project(project_path: PathBuf) -> Self {
        let project_name = project_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            project_name,
            project_path,
            ..Default::default()
        }
    }

    /// Absolute storage directory
    pub fn storage_dir(&self) -> PathBuf {
        self.project_path.join(&self.storage_path)
    }

    /// Absolute path of the metadata database
    pub fn database_path(&self) -> PathBuf {
        self.storage_dir().join(DATABASE_FILE_NAME)
    }

    /// Absolute path of the project config file
    pub fn config_path(&self) -> PathBuf {
        self.project_path.join(CONFIG_FILE_NAME)
    }
}

/// Loads, saves and mutates project configuration
#[derive(Debug)]
pub struct ConfigManager {
    project_path: PathBuf,
    global_config_path: PathBuf,
}

impl ConfigManager {
    /// Manager for the given project root
    pub fn new(project_path: PathBuf) -> Self {
        let global_config_path = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("gencodedoc")
            .join("config.yaml");
        Self {
            project_path,
            global_config_path,
        }
    }

    fn config_path(&self) -> PathBuf {
        self.project_path.join(CONFIG_FILE_NAME)
    }

    /// Whether the project carries a config file
    pub fn is_initialized(&self) -> bool {
        self.config_path().exists()
    }

    /// Load configuration: defaults, then global, then project overrides
    pub fn load(&self) -> Result<ProjectConfig> {
        let mut merged = serde_yaml::to_value(ProjectConfig::default())?;

        if self.global_config_path.exists() {
            let raw = std::fs::read_to_string(&self.global_config_path)?;
            let global: serde_yaml::Value = serde_yaml::from_str(&raw)?;
            merged = deep_merge(merged, global);
        }

        let project_file = self.config_path();
        if project_file.exists() {
            let raw = std::fs::read_to_string(&project_file)?;
            let project: serde_yaml::Value = serde_yaml::from_str(&raw)?;
            merged = deep_merge(merged, project);
        }

        let mut config: ProjectConfig = serde_yaml::from_value(merged)?;
        config.project_path = self.project_path.clone();
        if config.project_name.is_empty() {
            config.project_name = self
                .project_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
        }
        Ok(config)
    }

    /// Write the project config file, deduplicating ignore lists
    pub fn save(&self, config: &ProjectConfig) -> Result<()> {
        let mut config = config.clone();
        config.ignore.dedup();

        let yaml = serde_yaml::to_string(&config)?;
        std::fs::write(self.config_path(), yaml)?;
        debug!(path = %self.config_path().display(), "saved project config");
        Ok(())
    }

    /// Initialize a new project: defaults, auto-detected ignore rules,
    /// optional preset, then save
    pub fn init_project(&self, preset: Option<&str>) -> Result<ProjectConfig> {
        let mut config = ProjectConfig::for_project(self.project_path.clone());
        detect_ignore_rules(&self.project_path, &mut config.ignore);

        if let Some(name) = preset {
            apply_preset(&mut config, name)?;
        }

        self.save(&config)?;
        info!(
            project = config.project_name.as_str(),
            preset = preset.unwrap_or("none"),
            "initialized project"
        );
        Ok(config)
    }

    /// Set one configuration value by dotted key, e.g.
    /// `autosave.timer.interval` or `compression_level`
    ///
    /// Unknown keys and type mismatches are rejected; the updated config
    /// is persisted and returned.
    pub fn set_value(&self, dotted_key: &str, value: serde_json::Value) -> Result<ProjectConfig> {
        let config = self.load()?;
        let mut tree = serde_json::to_value(&config)?;

        let segments: Vec<&str> = dotted_key.split('.').collect();
        let (last, parents) = segments
            .split_last()
            .ok_or_else(|| SnapError::invalid("empty config key"))?;

        let mut node = &mut tree;
        for segment in parents {
            node = node
                .as_object_mut()
                .and_then(|map| map.get_mut(*segment))
                .ok_or_else(|| {
                    SnapError::invalid(format!("unknown config key: {}", dotted_key))
                })?;
        }
        let map = node
            .as_object_mut()
            .ok_or_else(|| SnapError::invalid(format!("'{}' is not a section", dotted_key)))?;
        if !map.contains_key(*last) {
            return Err(SnapError::invalid(format!(
                "unknown config key: {}",
                dotted_key
            )));
        }
        map.insert(last.to_string(), value);

        let mut updated: ProjectConfig = serde_json::from_value(tree)
            .map_err(|e| SnapError::invalid(format!("bad value for {}: {}", dotted_key, e)))?;
        updated.project_path = self.project_path.clone();
        self.save(&updated)?;
        Ok(updated)
    }

    /// Apply a named preset's ignore rules and persist the result
    pub fn apply_preset(&self, name: &str) -> Result<ProjectConfig> {
        let mut config = self.load()?;
        apply_preset(&mut config, name)?;
        self.save(&config)?;
        Ok(config)
    }

    /// Add or remove ignore rules of one kind and persist the result
    pub fn manage_ignore_rules(
        &self,
        action: &str,
        kind: &str,
        values: &[String],
    ) -> Result<ProjectConfig> {
        let mut config = self.load()?;
        let list = match kind {
            "dirs" => &mut config.ignore.dirs,
            "files" => &mut config.ignore.files,
            "extensions" => &mut config.ignore.extensions,
            "patterns" => &mut config.ignore.patterns,
            other => {
                return Err(SnapError::invalid(format!(
                    "unknown ignore rule kind: {}",
                    other
                )))
            }
        };

        match action {
            "add" => {
                for value in values {
                    if !list.contains(value) {
                        list.push(value.clone());
                    }
                }
            }
            "remove" => list.retain(|item| !values.contains(item)),
            other => {
                return Err(SnapError::invalid(format!(
                    "unknown ignore rule action: {} (expected add or remove)",
                    other
                )))
            }
        }

        self.save(&config)?;
        Ok(config)
    }
}

/// Extend ignore rules from markers found in the project tree
fn detect_ignore_rules(project_path: &Path, ignore: &mut IgnoreConfig) {
    let extend = |list: &mut Vec<String>, items: &[&str]| {
        for item in items {
            if !list.iter().any(|existing| existing == item) {
                list.push(item.to_string());
            }
        }
    };

    if project_path.join("requirements.txt").exists()
        || project_path.join("pyproject.toml").exists()
    {
        extend(&mut ignore.dirs, &["venv", ".venv", "__pycache__"]);
        extend(&mut ignore.extensions, &[".pyc", ".pyo"]);
    }
    if project_path.join("package.json").exists() {
        extend(&mut ignore.dirs, &["node_modules", "dist", ".next"]);
    }
    if project_path.join("go.mod").exists() {
        extend(&mut ignore.dirs, &["vendor"]);
    }
    if project_path.join("Cargo.toml").exists() {
        extend(&mut ignore.dirs, &["target"]);
    }
}

/// Merge preset ignore rules into the config
fn apply_preset(config: &mut ProjectConfig, name: &str) -> Result<()> {
    let (dirs, files, extensions): (&[&str], &[&str], &[&str]) = match name {
        "python" => (
            &["venv", ".venv", "__pycache__", "dist", "build", ".git", ".idea", ".vscode"],
            &[".DS_Store", "Thumbs.db"],
            &[".pyc", ".pyo", ".pyd", ".so", ".dll", ".class"],
        ),
        "nodejs" => (
            &["node_modules", "dist", "build", "coverage", ".git"],
            &["package-lock.json", "yarn.lock", ".DS_Store"],
            &[],
        ),
        "web" => (
            &["node_modules", "dist", ".git"],
            &[],
            &[".map", ".min.js", ".css.map"],
        ),
        "go" => (&["vendor", "bin", ".git"], &[], &[".exe", ".test"]),
        "rust" => (&["target", ".git"], &[], &[".rlib"]),
        other => {
            return Err(SnapError::invalid(format!("unknown preset: {}", other)));
        }
    };

    let extend = |list: &mut Vec<String>, items: &[&str]| {
        for item in items {
            if !list.iter().any(|existing| existing == item) {
                list.push(item.to_string());
            }
        }
    };
    extend(&mut config.ignore.dirs, dirs);
    extend(&mut config.ignore.files, files);
    extend(&mut config.ignore.extensions, extensions);
    Ok(())
}

/// Recursive mapping merge; the overlay wins on scalar conflicts
fn deep_merge(base: serde_yaml::Value, overlay: serde_yaml::Value) -> serde_yaml::Value {
    match (base, overlay) {
        (serde_yaml::Value::Mapping(mut base_map), serde_yaml::Value::Mapping(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => overlay_value,
                };
                base_map.insert(key, merged);
            }
            serde_yaml::Value::Mapping(base_map)
        }
        (_, overlay) => overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = ProjectConfig::for_project(PathBuf::from("/tmp/demo"));
        assert_eq!(config.project_name, "demo");
        assert_eq!(config.storage_path, ".gencodedoc");
        assert!(config.compression_enabled);
        assert_eq!(config.compression_level, 3);
        assert!(config.ignore.dirs.contains(&".git".to_string()));
        assert_eq!(config.database_path(), PathBuf::from("/tmp/demo/.gencodedoc/gencodedoc.db"));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::new(dir.path().to_path_buf());

        let mut config = ProjectConfig::for_project(dir.path().to_path_buf());
        config.compression_level = 9;
        config.ignore.patterns.push("*.tmp".to_string());
        manager.save(&config).unwrap();

        let loaded = manager.load().unwrap();
        assert_eq!(loaded.compression_level, 9);
        assert!(loaded.ignore.patterns.contains(&"*.tmp".to_string()));
        assert_eq!(loaded.project_path, dir.path());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "compression_level: 12\nautosave:\n  mode: hybrid\n",
        )
        .unwrap();

        let loaded = ConfigManager::new(dir.path().to_path_buf()).load().unwrap();
        assert_eq!(loaded.compression_level, 12);
        assert_eq!(loaded.autosave.mode, AutosaveMode::Hybrid);
        // Untouched sections keep their defaults
        assert_eq!(loaded.autosave.timer.interval, 300);
        assert_eq!(loaded.diff_format.unified_context, 3);
    }

    #[test]
    fn test_init_project_detects_python() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("requirements.txt"), "flask\n").unwrap();

        let manager = ConfigManager::new(dir.path().to_path_buf());
        let config = manager.init_project(None).unwrap();
        assert!(config.ignore.dirs.contains(&"__pycache__".to_string()));
        assert!(config.ignore.extensions.contains(&".pyc".to_string()));
        assert!(manager.is_initialized());
    }

    #[test]
    fn test_apply_preset_merges_without_duplicates() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::new(dir.path().to_path_buf());
        manager.init_project(Some("python")).unwrap();
        let config = manager.apply_preset("python").unwrap();

        let count = config
            .ignore
            .dirs
            .iter()
            .filter(|d| d.as_str() == "venv")
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_unknown_preset_rejected() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::new(dir.path().to_path_buf());
        manager.init_project(None).unwrap();
        assert!(matches!(
            manager.apply_preset("fortran").unwrap_err(),
            SnapError::Invalid(_)
        ));
    }

    #[test]
    fn test_set_value_dotted_key() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::new(dir.path().to_path_buf());
        manager.init_project(None).unwrap();

        let updated = manager
            .set_value("autosave.timer.interval", serde_json::json!(120))
            .unwrap();
        assert_eq!(updated.autosave.timer.interval, 120);

        let reloaded = manager.load().unwrap();
        assert_eq!(reloaded.autosave.timer.interval, 120);
    }

    #[test]
    fn test_set_value_unknown_key_rejected() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::new(dir.path().to_path_buf());
        manager.init_project(None).unwrap();

        assert!(matches!(
            manager
                .set_value("autosave.nonsense", serde_json::json!(1))
                .unwrap_err(),
            SnapError::Invalid(_)
        ));
        assert!(matches!(
            manager
                .set_value("compression_level", serde_json::json!("not a number"))
                .unwrap_err(),
            SnapError::Invalid(_)
        ));
    }

    #[test]
    fn test_manage_ignore_rules() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::new(dir.path().to_path_buf());
        manager.init_project(None).unwrap();

        let config = manager
            .manage_ignore_rules("add", "extensions", &[".log".to_string()])
            .unwrap();
        assert!(config.ignore.extensions.contains(&".log".to_string()));

        let config = manager
            .manage_ignore_rules("remove", "extensions", &[".log".to_string()])
            .unwrap();
        assert!(!config.ignore.extensions.contains(&".log".to_string()));

        assert!(manager
            .manage_ignore_rules("toggle", "extensions", &[])
            .is_err());
        assert!(manager.manage_ignore_rules("add", "stuff", &[]).is_err());
    }
}
