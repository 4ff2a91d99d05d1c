//! Request router
//!
//! Single entry point translating line-delimited JSON-RPC 2.0 requests
//! into engine calls. The protocol surface is MCP-shaped: `initialize`,
//! `tools/list` and `tools/call`, with every tool dispatched by name
//! through a static table. Notifications (absent id) and any method under
//! `notifications/` are silently ignored; a request whose id cannot be
//! parsed is answered with id 0.
//!
//! The router owns the per-project state: version managers are cached by
//! absolute project path and invalidated whenever a configuration-mutating
//! tool runs, and long-lived autosave controllers are held here until
//! `stop_autosave` or shutdown.

use crate::autosave::AutosaveController;
use crate::config::{AutosaveMode, ConfigManager, ProjectConfig};
use crate::diff::DiffFormat;
use crate::error::{Result, SnapError};
use crate::utils::format_bytes;
use crate::versioning::{CreateOptions, VersionManager};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Protocol version echoed by `initialize`
const PROTOCOL_VERSION: &str = "2024-11-05";

const PARSE_ERROR: i64 = -32700;
const INVALID_PARAMS: i64 = -32602;
const INTERNAL_ERROR: i64 = -32603;

type ToolHandler = fn(&RequestRouter, &mut Map<String, Value>) -> Result<Value>;

struct ToolSpec {
    name: &'static str,
    description: &'static str,
    handler: ToolHandler,
}

struct ProjectHandles {
    config: ProjectConfig,
    manager: Arc<VersionManager>,
}

/// Line-delimited JSON-RPC front door for the snapshot engine
pub struct RequestRouter {
    default_project: Option<PathBuf>,
    managers: Mutex<HashMap<PathBuf, ProjectHandles>>,
    autosaves: Mutex<HashMap<PathBuf, AutosaveController>>,
}

impl std::fmt::Debug for RequestRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRouter")
            .field("default_project", &self.default_project)
            .finish_non_exhaustive()
    }
}

impl RequestRouter {
    /// Router with an optional default project used when a tool call
    /// omits `project_path`
    pub fn new(default_project: Option<PathBuf>) -> Self {
        Self {
            default_project,
            managers: Mutex::new(HashMap::new()),
            autosaves: Mutex::new(HashMap::new()),
        }
    }

    /// Serve requests line by line until the reader is exhausted
    pub fn serve(&self, reader: impl BufRead, mut writer: impl Write) -> Result<()> {
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if let Some(reply) = self.handle_line(&line) {
                writeln!(writer, "{}", reply)?;
                writer.flush()?;
            }
        }
        self.shutdown();
        Ok(())
    }

    /// Handle one raw request line; `None` means no reply is owed
    pub fn handle_line(&self, line: &str) -> Option<String> {
        let request: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(err) => {
                warn!(%err, "unparseable request line");
                return Some(
                    error_envelope(json!(0), PARSE_ERROR, &format!("parse error: {}", err))
                        .to_string(),
                );
            }
        };
        self.handle_request(&request).map(|reply| reply.to_string())
    }

    /// Handle one parsed request envelope
    pub fn handle_request(&self, request: &Value) -> Option<Value> {
        let method = request.get("method").and_then(Value::as_str).unwrap_or("");

        // Notifications never get a reply, whatever the method
        let id = match request.get("id") {
            None | Some(Value::Null) => return None,
            Some(id) => normalize_id(id),
        };
        if method.starts_with("notifications/") {
            return None;
        }

        debug!(method, "dispatching request");

        let reply = match method {
            "initialize" => Ok(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": {
                    "name": "gencodedoc",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            })),
            "tools/list" => Ok(json!({ "tools": tool_descriptors() })),
            "tools/call" => self.handle_tool_call(request.get("params")),
            other => Err((
                INTERNAL_ERROR,
                format!("unknown method: {}", other),
            )),
        };

        Some(match reply {
            Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
            Err((code, message)) => error_envelope(id, code, &message),
        })
    }

    /// Stop every live autosave controller
    pub fn shutdown(&self) {
        let mut autosaves = self.autosaves.lock();
        for (project, mut controller) in autosaves.drain() {
            if let Err(err) = controller.stop() {
                warn!(project = %project.display(), %err, "autosave stop failed on shutdown");
            }
        }
        info!("router shut down");
    }

    fn handle_tool_call(&self, params: Option<&Value>) -> std::result::Result<Value, (i64, String)> {
        let params = params
            .and_then(Value::as_object)
            .ok_or((INVALID_PARAMS, "tools/call requires params".to_string()))?;
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or((INVALID_PARAMS, "tools/call requires a tool name".to_string()))?;
        let mut arguments = params
            .get("arguments")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let Some(tool) = TOOL_TABLE.iter().find(|t| t.name == name) else {
            return Ok(error_result(&format!("Unknown tool: {}", name)));
        };

        match (tool.handler)(self, &mut arguments) {
            Ok(result) => Ok(result),
            // An unchanged tree is an expected outcome, not a tool error
            Err(SnapError::NoChanges) => Ok(text_result(
                "No changes detected since last snapshot",
                json!({ "created": false }),
            )),
            Err(err) => {
                debug!(tool = name, %err, "tool call failed");
                Ok(error_result(&format!("Error ({}): {}", err.kind(), err)))
            }
        }
    }

    // ── per-project state ──────────────────────────────────────────

    /// Resolve the project a tool call targets
    ///
    /// Most tools pop an optional `project_path` argument, falling back to
    /// the router's default project. The lifecycle tools (`init_project`,
    /// `start_autosave`, `stop_autosave`) pass `require_explicit`: the
    /// argument stays in the map and must be present.
    fn resolve_project(
        &self,
        args: &mut Map<String, Value>,
        require_explicit: bool,
    ) -> Result<PathBuf> {
        let from_args = if require_explicit {
            args.get("project_path").and_then(Value::as_str).map(String::from)
        } else {
            args.remove("project_path")
                .and_then(|v| v.as_str().map(String::from))
        };

        let path = match from_args {
            Some(path) => PathBuf::from(path),
            None if require_explicit => {
                return Err(SnapError::invalid("project_path is required"))
            }
            None => self
                .default_project
                .clone()
                .ok_or_else(|| SnapError::invalid("project_path is required"))?,
        };

        Ok(std::fs::canonicalize(&path).unwrap_or(path))
    }

    fn with_manager<T>(
        &self,
        project: &Path,
        f: impl FnOnce(&ProjectConfig, &Arc<VersionManager>) -> Result<T>,
    ) -> Result<T> {
        let mut managers = self.managers.lock();
        if !managers.contains_key(project) {
            let config = ConfigManager::new(project.to_path_buf()).load()?;
            let manager = Arc::new(VersionManager::open(&config)?);
            managers.insert(
                project.to_path_buf(),
                ProjectHandles {
                    config,
                    manager,
                },
            );
        }
        let handles = managers.get(project).expect("just inserted");
        f(&handles.config, &handles.manager)
    }

    fn invalidate(&self, project: &Path) {
        self.managers.lock().remove(project);
        debug!(project = %project.display(), "manager cache invalidated");
    }
}

// ── reply shaping ──────────────────────────────────────────────────

fn normalize_id(id: &Value) -> Value {
    match id {
        Value::Number(_) | Value::String(_) => id.clone(),
        // Present but unparseable: echo id 0
        _ => json!(0),
    }
}

fn error_envelope(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
}

/// Successful tool result: a text block plus machine-readable fields
fn text_result(text: &str, data: Value) -> Value {
    let mut result = Map::new();
    result.insert(
        "content".to_string(),
        json!([{ "type": "text", "text": text }]),
    );
    if let Value::Object(fields) = data {
        result.extend(fields);
    }
    Value::Object(result)
}

/// Failed tool result carrying the structured error text
fn error_result(text: &str) -> Value {
    json!({
        "content": [{ "type": "text", "text": text }],
        "isError": true,
    })
}

// ── argument helpers ───────────────────────────────────────────────

fn arg_str(args: &Map<String, Value>, key: &str) -> Option<String> {
    args.get(key).and_then(Value::as_str).map(String::from)
}

fn require_str(args: &Map<String, Value>, key: &str) -> Result<String> {
    arg_str(args, key).ok_or_else(|| SnapError::invalid(format!("'{}' is required", key)))
}

fn arg_bool(args: &Map<String, Value>, key: &str, default: bool) -> bool {
    args.get(key).and_then(Value::as_bool).unwrap_or(default)
}

fn arg_usize(args: &Map<String, Value>, key: &str) -> Option<usize> {
    args.get(key).and_then(Value::as_u64).map(|v| v as usize)
}

fn arg_str_list(args: &Map<String, Value>, key: &str) -> Option<Vec<String>> {
    let list = args.get(key)?.as_array()?;
    Some(
        list.iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
    )
}

// ── tool handlers ──────────────────────────────────────────────────

fn tool_init_project(router: &RequestRouter, args: &mut Map<String, Value>) -> Result<Value> {
    let project = router.resolve_project(args, true)?;
    let preset = arg_str(args, "preset");

    let config = ConfigManager::new(project.clone()).init_project(preset.as_deref())?;
    let manager = Arc::new(VersionManager::init(&config)?);

    router.managers.lock().insert(
        project.clone(),
        ProjectHandles {
            config: config.clone(),
            manager,
        },
    );

    let config_path = config.config_path();
    let storage_path = config.storage_dir();
    Ok(text_result(
        &format!(
            "Initialized project '{}'\nConfig: {}\nStorage: {}",
            config.project_name,
            config_path.display(),
            storage_path.display()
        ),
        json!({
            "config_path": config_path.display().to_string(),
            "storage_path": storage_path.display().to_string(),
        }),
    ))
}

fn tool_get_project_status(router: &RequestRouter, args: &mut Map<String, Value>) -> Result<Value> {
    let project = router.resolve_project(args, false)?;

    let config_manager = ConfigManager::new(project.clone());
    let initialized = config_manager.is_initialized();
    if !initialized {
        return Ok(text_result(
            &format!("Project not initialized: {}", project.display()),
            json!({ "initialized": false }),
        ));
    }

    let autosave_running = router.autosaves.lock().contains_key(&project);
    router.with_manager(&project, |config, manager| {
        let (snapshots, autosaves) = manager.database().snapshot_counts()?;
        let (blobs, stored_bytes) = manager.database().content_stats()?;
        Ok(text_result(
            &format!(
                "Project: {}\nSnapshots: {} ({} autosaves)\nContent blobs: {} ({})\nAutosave running: {}",
                config.project_name,
                snapshots,
                autosaves,
                blobs,
                format_bytes(stored_bytes),
                autosave_running
            ),
            json!({
                "initialized": true,
                "snapshots": snapshots,
                "autosaves": autosaves,
                "content_blobs": blobs,
                "stored_bytes": stored_bytes,
                "autosave_running": autosave_running,
            }),
        ))
    })
}

fn tool_create_snapshot(router: &RequestRouter, args: &mut Map<String, Value>) -> Result<Value> {
    let project = router.resolve_project(args, false)?;
    let opts = CreateOptions {
        message: arg_str(args, "message"),
        tag: arg_str(args, "tag"),
        include_paths: arg_str_list(args, "include_paths"),
        exclude_paths: arg_str_list(args, "exclude_paths"),
        is_autosave: false,
        trigger_type: "manual".to_string(),
    };

    router.with_manager(&project, |_, manager| {
        let snapshot = manager.create_snapshot(opts)?;
        Ok(text_result(
            &format!(
                "Snapshot ID: {}\nFiles: {}\nTotal size: {}",
                snapshot.metadata.id,
                snapshot.metadata.files_count,
                format_bytes(snapshot.metadata.total_size)
            ),
            json!({
                "created": true,
                "snapshot_id": snapshot.metadata.id,
                "tag": snapshot.metadata.tag,
                "files_count": snapshot.metadata.files_count,
                "total_size": snapshot.metadata.total_size,
                "compressed_size": snapshot.metadata.compressed_size,
            }),
        ))
    })
}

fn tool_list_snapshots(router: &RequestRouter, args: &mut Map<String, Value>) -> Result<Value> {
    let project = router.resolve_project(args, false)?;
    let limit = arg_usize(args, "limit");
    let include_autosave = arg_bool(args, "include_autosave", true);

    router.with_manager(&project, |_, manager| {
        let snapshots = manager.list_snapshots(limit, include_autosave)?;
        let mut lines = Vec::new();
        for s in &snapshots {
            lines.push(format!(
                "#{} {} [{}] {} files, {}{}",
                s.id,
                s.created_at.format("%Y-%m-%d %H:%M:%S"),
                s.tag.as_deref().unwrap_or("-"),
                s.files_count,
                format_bytes(s.total_size),
                if s.is_autosave { " (autosave)" } else { "" },
            ));
        }
        let text = if lines.is_empty() {
            "No snapshots yet".to_string()
        } else {
            lines.join("\n")
        };
        Ok(text_result(&text, json!({ "snapshots": snapshots })))
    })
}

fn tool_get_snapshot_details(router: &RequestRouter, args: &mut Map<String, Value>) -> Result<Value> {
    let project = router.resolve_project(args, false)?;
    let snapshot_ref = require_str(args, "snapshot_ref")?;

    router.with_manager(&project, |_, manager| {
        let snapshot = manager
            .get_snapshot(&snapshot_ref)?
            .ok_or_else(|| SnapError::SnapshotNotFound(snapshot_ref.clone()))?;

        let preview: Vec<&str> = snapshot
            .files
            .iter()
            .take(20)
            .map(|f| f.path.as_str())
            .collect();
        let more = snapshot.files.len().saturating_sub(preview.len());
        let mut text = format!(
            "Snapshot #{} [{}]\nCreated: {}\nTrigger: {}\nFiles: {}\nSize: {} ({} stored)\n\n{}",
            snapshot.metadata.id,
            snapshot.metadata.tag.as_deref().unwrap_or("-"),
            snapshot.metadata.created_at.format("%Y-%m-%d %H:%M:%S"),
            snapshot.metadata.trigger_type,
            snapshot.metadata.files_count,
            format_bytes(snapshot.metadata.total_size),
            format_bytes(snapshot.metadata.compressed_size),
            preview.join("\n"),
        );
        if more > 0 {
            text.push_str(&format!("\n... and {} more", more));
        }

        Ok(text_result(
            &text,
            json!({
                "metadata": snapshot.metadata,
                "files_preview": preview,
            }),
        ))
    })
}

fn tool_restore_snapshot(router: &RequestRouter, args: &mut Map<String, Value>) -> Result<Value> {
    let project = router.resolve_project(args, false)?;
    let snapshot_ref = require_str(args, "snapshot_ref")?;
    let force = arg_bool(args, "force", false);
    let filters = arg_str_list(args, "file_filters");

    router.with_manager(&project, |_, manager| {
        let report = manager.restore(&snapshot_ref, None, force, filters.as_deref())?;
        Ok(text_result(
            &format!(
                "Restored {} of {} files ({} skipped)",
                report.restored, report.total, report.skipped
            ),
            json!({ "report": report }),
        ))
    })
}

fn tool_restore_files(router: &RequestRouter, args: &mut Map<String, Value>) -> Result<Value> {
    let project = router.resolve_project(args, false)?;
    let snapshot_ref = require_str(args, "snapshot_ref")?;
    let filters = arg_str_list(args, "file_filters")
        .filter(|f| !f.is_empty())
        .ok_or_else(|| SnapError::invalid("'file_filters' is required"))?;
    let force = arg_bool(args, "force", false);

    router.with_manager(&project, |_, manager| {
        let report = manager.restore(&snapshot_ref, None, force, Some(&filters))?;
        Ok(text_result(
            &format!(
                "Restored {} of {} selected files ({} skipped)",
                report.restored, report.total, report.skipped
            ),
            json!({ "report": report }),
        ))
    })
}

fn tool_delete_snapshot(router: &RequestRouter, args: &mut Map<String, Value>) -> Result<Value> {
    let project = router.resolve_project(args, false)?;
    let snapshot_ref = require_str(args, "snapshot_ref")?;

    router.with_manager(&project, |_, manager| {
        let deleted = manager.delete_snapshot(&snapshot_ref)?;
        let text = if deleted {
            format!("Deleted snapshot '{}'", snapshot_ref)
        } else {
            format!("Snapshot '{}' not found", snapshot_ref)
        };
        Ok(text_result(&text, json!({ "deleted": deleted })))
    })
}

fn tool_diff_versions(router: &RequestRouter, args: &mut Map<String, Value>) -> Result<Value> {
    let project = router.resolve_project(args, false)?;
    let from_ref = require_str(args, "from_ref")?;
    let to_ref = arg_str(args, "to_ref").unwrap_or_else(|| "current".to_string());
    let filters = arg_str_list(args, "file_filters");

    router.with_manager(&project, |config, manager| {
        let format: DiffFormat = arg_str(args, "format")
            .unwrap_or_else(|| config.diff_format.default.clone())
            .parse()?;
        let diff = manager.diff(&from_ref, &to_ref, filters.as_deref())?;
        let rendered = manager.render_diff(&diff, format)?;

        Ok(text_result(
            &rendered,
            json!({
                "files_added": diff.files_added.len(),
                "files_removed": diff.files_removed.len(),
                "files_modified": diff.files_modified.len(),
                "total_changes": diff.total_changes,
                "significance": diff.significance,
            }),
        ))
    })
}

fn tool_get_file_at_version(router: &RequestRouter, args: &mut Map<String, Value>) -> Result<Value> {
    let project = router.resolve_project(args, false)?;
    let snapshot_ref = require_str(args, "snapshot_ref")?;
    let file_path = require_str(args, "file_path")?;

    router.with_manager(&project, |_, manager| {
        let (entry, bytes) = manager.get_file_at_version(&snapshot_ref, &file_path)?;
        match String::from_utf8(bytes) {
            Ok(text) => Ok(text_result(
                &text,
                json!({ "path": entry.path, "size": entry.size, "hash": entry.hash, "binary": false }),
            )),
            Err(raw) => Ok(text_result(
                &format!("Binary file: {} ({})", entry.path, format_bytes(entry.size)),
                json!({
                    "path": entry.path,
                    "size": raw.as_bytes().len(),
                    "hash": entry.hash,
                    "binary": true,
                }),
            )),
        }
    })
}

fn tool_list_files_at_version(router: &RequestRouter, args: &mut Map<String, Value>) -> Result<Value> {
    let project = router.resolve_project(args, false)?;
    let snapshot_ref = require_str(args, "snapshot_ref")?;
    let pattern = arg_str(args, "pattern");

    router.with_manager(&project, |_, manager| {
        let files = manager.list_files_at_version(&snapshot_ref, pattern.as_deref())?;
        let lines: Vec<String> = files
            .iter()
            .map(|f| format!("{} ({})", f.path, format_bytes(f.size)))
            .collect();
        let text = if lines.is_empty() {
            "No matching files".to_string()
        } else {
            lines.join("\n")
        };
        Ok(text_result(&text, json!({ "files": files })))
    })
}

fn tool_export_snapshot(router: &RequestRouter, args: &mut Map<String, Value>) -> Result<Value> {
    let project = router.resolve_project(args, false)?;
    let snapshot_ref = require_str(args, "snapshot_ref")?;
    let output_path = PathBuf::from(require_str(args, "output_path")?);
    let archive = arg_bool(args, "archive", false);
    let filters = arg_str_list(args, "file_filters");

    router.with_manager(&project, |_, manager| {
        let report = manager.export(&snapshot_ref, &output_path, archive, filters.as_deref())?;
        let mut text = format!(
            "Exported {} files to {} ({})",
            report.exported, report.output_path, report.format
        );
        if report.archive_size > 0 {
            text.push_str(&format!(", archive {}", format_bytes(report.archive_size)));
        }
        Ok(text_result(&text, json!({ "report": report })))
    })
}

fn tool_cleanup_orphaned_contents(
    router: &RequestRouter,
    args: &mut Map<String, Value>,
) -> Result<Value> {
    let project = router.resolve_project(args, false)?;
    router.with_manager(&project, |_, manager| {
        let deleted = manager.cleanup_orphaned_contents()?;
        Ok(text_result(
            &format!("Deleted {} orphaned content blob(s)", deleted),
            json!({ "deleted": deleted }),
        ))
    })
}

fn tool_get_file_history(router: &RequestRouter, args: &mut Map<String, Value>) -> Result<Value> {
    let project = router.resolve_project(args, false)?;
    let file_path = require_str(args, "file_path")?;

    router.with_manager(&project, |_, manager| {
        let history = manager.file_history(&file_path)?;
        let lines: Vec<String> = history
            .iter()
            .map(|h| {
                format!(
                    "#{} {} {:?}",
                    h.snapshot_id,
                    h.created_at.format("%Y-%m-%d %H:%M:%S"),
                    h.status
                )
            })
            .collect();
        let text = if lines.is_empty() {
            format!("No history for '{}'", file_path)
        } else {
            lines.join("\n")
        };
        Ok(text_result(&text, json!({ "history": history })))
    })
}

fn tool_search_snapshots(router: &RequestRouter, args: &mut Map<String, Value>) -> Result<Value> {
    let project = router.resolve_project(args, false)?;
    let query = require_str(args, "query")?;
    let file_filter = arg_str(args, "file_filter");
    let snapshot_ref = arg_str(args, "snapshot_ref");
    let case_sensitive = arg_bool(args, "case_sensitive", false);

    router.with_manager(&project, |_, manager| {
        let results = manager.search(
            &query,
            file_filter.as_deref(),
            snapshot_ref.as_deref(),
            case_sensitive,
        )?;

        let mut lines = Vec::new();
        for result in &results {
            lines.push(format!(
                "{} (snapshot {}, {} match(es))",
                result.path, result.snapshot_label, result.total_matches
            ));
            for m in &result.matches {
                lines.push(format!("  {}: {}", m.line_number, m.line));
            }
        }
        let text = if lines.is_empty() {
            format!("No matches for '{}'", query)
        } else {
            lines.join("\n")
        };
        Ok(text_result(&text, json!({ "results": results })))
    })
}

fn tool_generate_changelog(router: &RequestRouter, args: &mut Map<String, Value>) -> Result<Value> {
    let project = router.resolve_project(args, false)?;
    let from_ref = require_str(args, "from_ref")?;
    let to_ref = arg_str(args, "to_ref");

    router.with_manager(&project, |_, manager| {
        let markdown = manager.changelog(&from_ref, to_ref.as_deref())?;
        Ok(text_result(&markdown, json!({ "markdown": markdown })))
    })
}

fn tool_get_config(router: &RequestRouter, args: &mut Map<String, Value>) -> Result<Value> {
    let project = router.resolve_project(args, false)?;
    let config = ConfigManager::new(project).load()?;
    let yaml = serde_yaml::to_string(&config)?;
    Ok(text_result(&yaml, json!({ "config": config })))
}

fn tool_set_config_value(router: &RequestRouter, args: &mut Map<String, Value>) -> Result<Value> {
    let project = router.resolve_project(args, false)?;
    let key = require_str(args, "key")?;
    let value = args
        .get("value")
        .cloned()
        .ok_or_else(|| SnapError::invalid("'value' is required"))?;

    let config = ConfigManager::new(project.clone()).set_value(&key, value)?;
    router.invalidate(&project);
    Ok(text_result(
        &format!("Set {} for project '{}'", key, config.project_name),
        json!({ "config": config }),
    ))
}

fn tool_apply_preset(router: &RequestRouter, args: &mut Map<String, Value>) -> Result<Value> {
    let project = router.resolve_project(args, false)?;
    let preset = require_str(args, "preset")?;

    let config = ConfigManager::new(project.clone()).apply_preset(&preset)?;
    router.invalidate(&project);
    Ok(text_result(
        &format!("Applied preset '{}'", preset),
        json!({ "config": config }),
    ))
}

fn tool_manage_ignore_rules(router: &RequestRouter, args: &mut Map<String, Value>) -> Result<Value> {
    let project = router.resolve_project(args, false)?;
    let action = require_str(args, "action")?;
    let kind = require_str(args, "rule_type")?;
    let values = arg_str_list(args, "values").unwrap_or_default();

    let config = ConfigManager::new(project.clone()).manage_ignore_rules(&action, &kind, &values)?;
    router.invalidate(&project);
    Ok(text_result(
        &format!("Ignore rules updated ({} {})", action, kind),
        json!({ "ignore": config.ignore }),
    ))
}

fn tool_start_autosave(router: &RequestRouter, args: &mut Map<String, Value>) -> Result<Value> {
    let project = router.resolve_project(args, true)?;

    if router.autosaves.lock().contains_key(&project) {
        return Ok(text_result(
            &format!("Autosave already running for {}", project.display()),
            json!({ "running": true }),
        ));
    }

    let mode_override = match arg_str(args, "mode").as_deref() {
        None => None,
        Some("timer") => Some(AutosaveMode::Timer),
        Some("diff") => Some(AutosaveMode::Diff),
        Some("hybrid") => Some(AutosaveMode::Hybrid),
        Some(other) => {
            return Err(SnapError::invalid(format!("unknown autosave mode: {}", other)))
        }
    };

    let (autosave_config, manager) = {
        let mut managers = router.managers.lock();
        if !managers.contains_key(&project) {
            let config = ConfigManager::new(project.clone()).load()?;
            let manager = Arc::new(VersionManager::open(&config)?);
            managers.insert(
                project.clone(),
                ProjectHandles { config, manager },
            );
        }
        let handles = managers.get(&project).expect("just inserted");
        (handles.config.autosave.clone(), Arc::clone(&handles.manager))
    };

    let controller = AutosaveController::start(manager, autosave_config, mode_override)?;
    let mode = controller.mode().to_string();
    router.autosaves.lock().insert(project.clone(), controller);

    Ok(text_result(
        &format!("Autosave started ({} mode) for {}", mode, project.display()),
        json!({ "running": true, "mode": mode }),
    ))
}

fn tool_stop_autosave(router: &RequestRouter, args: &mut Map<String, Value>) -> Result<Value> {
    let project = router.resolve_project(args, true)?;

    match router.autosaves.lock().remove(&project) {
        Some(mut controller) => {
            controller.stop()?;
            Ok(text_result(
                &format!("Autosave stopped for {}", project.display()),
                json!({ "running": false }),
            ))
        }
        None => Ok(text_result(
            &format!("Autosave was not running for {}", project.display()),
            json!({ "running": false }),
        )),
    }
}

fn tool_get_autosave_status(router: &RequestRouter, _args: &mut Map<String, Value>) -> Result<Value> {
    let autosaves = router.autosaves.lock();
    let mut statuses = Vec::new();
    for controller in autosaves.values() {
        statuses.push(controller.status()?);
    }

    let text = if statuses.is_empty() {
        "No autosave loops running".to_string()
    } else {
        statuses
            .iter()
            .map(|s| format!("{} ({} mode)", s.project_path, s.mode))
            .collect::<Vec<_>>()
            .join("\n")
    };
    Ok(text_result(&text, json!({ "autosaves": statuses })))
}

// ── tool table ─────────────────────────────────────────────────────

static TOOL_TABLE: &[ToolSpec] = &[
    ToolSpec {
        name: "init_project",
        description: "Initialize snapshot tracking for a project directory",
        handler: tool_init_project,
    },
    ToolSpec {
        name: "get_project_status",
        description: "Snapshot counts, storage use and autosave state for a project",
        handler: tool_get_project_status,
    },
    ToolSpec {
        name: "create_snapshot",
        description: "Create a snapshot of the working tree",
        handler: tool_create_snapshot,
    },
    ToolSpec {
        name: "list_snapshots",
        description: "List snapshots newest-first",
        handler: tool_list_snapshots,
    },
    ToolSpec {
        name: "get_snapshot_details",
        description: "Metadata and file preview for one snapshot",
        handler: tool_get_snapshot_details,
    },
    ToolSpec {
        name: "restore_snapshot",
        description: "Restore a snapshot into the working tree",
        handler: tool_restore_snapshot,
    },
    ToolSpec {
        name: "restore_files",
        description: "Restore selected files from a snapshot",
        handler: tool_restore_files,
    },
    ToolSpec {
        name: "delete_snapshot",
        description: "Delete a snapshot by id or tag",
        handler: tool_delete_snapshot,
    },
    ToolSpec {
        name: "diff_versions",
        description: "Diff two snapshots, or a snapshot against the working tree",
        handler: tool_diff_versions,
    },
    ToolSpec {
        name: "get_file_at_version",
        description: "Read one file's content as recorded at a snapshot",
        handler: tool_get_file_at_version,
    },
    ToolSpec {
        name: "list_files_at_version",
        description: "List files recorded at a snapshot, optionally glob-filtered",
        handler: tool_list_files_at_version,
    },
    ToolSpec {
        name: "export_snapshot",
        description: "Export a snapshot to a folder or tar.gz archive",
        handler: tool_export_snapshot,
    },
    ToolSpec {
        name: "cleanup_orphaned_contents",
        description: "Garbage-collect content blobs no snapshot references",
        handler: tool_cleanup_orphaned_contents,
    },
    ToolSpec {
        name: "get_file_history",
        description: "Chronological history of one file across snapshots",
        handler: tool_get_file_history,
    },
    ToolSpec {
        name: "search_snapshots",
        description: "Search stored file content across snapshots",
        handler: tool_search_snapshots,
    },
    ToolSpec {
        name: "generate_changelog",
        description: "Keep-a-Changelog Markdown between two snapshots",
        handler: tool_generate_changelog,
    },
    ToolSpec {
        name: "get_config",
        description: "Current project configuration",
        handler: tool_get_config,
    },
    ToolSpec {
        name: "set_config_value",
        description: "Set one configuration value by dotted key",
        handler: tool_set_config_value,
    },
    ToolSpec {
        name: "apply_preset",
        description: "Apply a named ignore-rule preset",
        handler: tool_apply_preset,
    },
    ToolSpec {
        name: "manage_ignore_rules",
        description: "Add or remove ignore rules",
        handler: tool_manage_ignore_rules,
    },
    ToolSpec {
        name: "start_autosave",
        description: "Start the autosave loop for a project",
        handler: tool_start_autosave,
    },
    ToolSpec {
        name: "stop_autosave",
        description: "Stop the autosave loop for a project",
        handler: tool_stop_autosave,
    },
    ToolSpec {
        name: "get_autosave_status",
        description: "Status of every running autosave loop",
        handler: tool_get_autosave_status,
    },
];

fn tool_descriptors() -> Vec<Value> {
    TOOL_TABLE
        .iter()
        .map(|tool| {
            json!({
                "name": tool.name,
                "description": tool.description,
                "inputSchema": input_schema(tool.name),
            })
        })
        .collect()
}

fn input_schema(tool: &str) -> Value {
    let props = |fields: &[(&str, &str, &str)]| -> Value {
        let mut map = Map::new();
        map.insert(
            "project_path".to_string(),
            json!({ "type": "string", "description": "Project root (defaults to the server's project)" }),
        );
        for (name, kind, description) in fields {
            map.insert(
                name.to_string(),
                json!({ "type": kind, "description": description }),
            );
        }
        Value::Object(map)
    };
    let schema = |properties: Value, required: &[&str]| -> Value {
        json!({ "type": "object", "properties": properties, "required": required })
    };

    match tool {
        "init_project" => schema(
            props(&[("preset", "string", "Ignore preset: python, nodejs, web, go or rust")]),
            &["project_path"],
        ),
        "create_snapshot" => schema(
            props(&[
                ("message", "string", "Snapshot message"),
                ("tag", "string", "Unique tag"),
                ("include_paths", "array", "Only scan these paths"),
                ("exclude_paths", "array", "Drop these exact relative paths"),
            ]),
            &[],
        ),
        "list_snapshots" => schema(
            props(&[
                ("limit", "integer", "Maximum snapshots returned"),
                ("include_autosave", "boolean", "Include autosaves (default true)"),
            ]),
            &[],
        ),
        "get_snapshot_details" | "delete_snapshot" => schema(
            props(&[("snapshot_ref", "string", "Snapshot id or tag")]),
            &["snapshot_ref"],
        ),
        "restore_snapshot" => schema(
            props(&[
                ("snapshot_ref", "string", "Snapshot id or tag"),
                ("force", "boolean", "Overwrite existing files"),
                ("file_filters", "array", "Glob patterns or path prefixes"),
            ]),
            &["snapshot_ref"],
        ),
        "restore_files" => schema(
            props(&[
                ("snapshot_ref", "string", "Snapshot id or tag"),
                ("file_filters", "array", "Glob patterns or path prefixes"),
                ("force", "boolean", "Overwrite existing files"),
            ]),
            &["snapshot_ref", "file_filters"],
        ),
        "diff_versions" => schema(
            props(&[
                ("from_ref", "string", "Source snapshot id or tag"),
                ("to_ref", "string", "Target snapshot id, tag, or 'current'"),
                ("format", "string", "unified, json, markdown or ast"),
                ("file_filters", "array", "Glob patterns or path prefixes"),
            ]),
            &["from_ref"],
        ),
        "get_file_at_version" => schema(
            props(&[
                ("snapshot_ref", "string", "Snapshot id or tag"),
                ("file_path", "string", "Project-relative file path"),
            ]),
            &["snapshot_ref", "file_path"],
        ),
        "list_files_at_version" => schema(
            props(&[
                ("snapshot_ref", "string", "Snapshot id or tag"),
                ("pattern", "string", "Full-path glob filter"),
            ]),
            &["snapshot_ref"],
        ),
        "export_snapshot" => schema(
            props(&[
                ("snapshot_ref", "string", "Snapshot id or tag"),
                ("output_path", "string", "Target folder or archive path"),
                ("archive", "boolean", "Write a tar.gz archive"),
                ("file_filters", "array", "Glob patterns or path prefixes"),
            ]),
            &["snapshot_ref", "output_path"],
        ),
        "get_file_history" => schema(
            props(&[("file_path", "string", "Project-relative file path")]),
            &["file_path"],
        ),
        "search_snapshots" => schema(
            props(&[
                ("query", "string", "Substring to search for"),
                ("file_filter", "string", "Full-path glob filter"),
                ("snapshot_ref", "string", "Restrict to one snapshot"),
                ("case_sensitive", "boolean", "Match case (default false)"),
            ]),
            &["query"],
        ),
        "generate_changelog" => schema(
            props(&[
                ("from_ref", "string", "Source snapshot id or tag"),
                ("to_ref", "string", "Target snapshot id, tag, or 'current'"),
            ]),
            &["from_ref"],
        ),
        "set_config_value" => schema(
            props(&[
                ("key", "string", "Dotted config key, e.g. autosave.timer.interval"),
                ("value", "string", "New value"),
            ]),
            &["key", "value"],
        ),
        "apply_preset" => schema(
            props(&[("preset", "string", "python, nodejs, web, go or rust")]),
            &["preset"],
        ),
        "manage_ignore_rules" => schema(
            props(&[
                ("action", "string", "add or remove"),
                ("rule_type", "string", "dirs, files, extensions or patterns"),
                ("values", "array", "Rule values"),
            ]),
            &["action", "rule_type"],
        ),
        "start_autosave" => schema(
            props(&[("mode", "string", "timer, diff or hybrid (defaults to config)")]),
            &["project_path"],
        ),
        "stop_autosave" => schema(props(&[]), &["project_path"]),
        _ => schema(props(&[]), &[]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn call(router: &RequestRouter, id: u64, name: &str, arguments: Value) -> Value {
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "tools/call",
            "params": { "name": name, "arguments": arguments },
        });
        router.handle_request(&request).expect("reply expected")
    }

    fn result_text(reply: &Value) -> String {
        reply["result"]["content"][0]["text"]
            .as_str()
            .unwrap_or_default()
            .to_string()
    }

    fn init_project(router: &RequestRouter, dir: &TempDir) {
        let reply = call(
            router,
            1,
            "init_project",
            json!({ "project_path": dir.path().to_string_lossy() }),
        );
        assert!(result_text(&reply).contains("Initialized project"));
    }

    #[test]
    fn test_initialize_handshake() {
        let router = RequestRouter::new(None);
        let reply = router
            .handle_request(&json!({
                "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {},
            }))
            .unwrap();

        assert_eq!(reply["result"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(reply["result"]["serverInfo"]["name"], "gencodedoc");
        assert!(reply["result"]["capabilities"]["tools"].is_object());
    }

    #[test]
    fn test_tools_list_is_static() {
        let router = RequestRouter::new(None);
        let reply = router
            .handle_request(&json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" }))
            .unwrap();

        let tools = reply["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), TOOL_TABLE.len());
        assert!(tools.iter().any(|t| t["name"] == "create_snapshot"));
    }

    #[test]
    fn test_notifications_are_silent() {
        let router = RequestRouter::new(None);
        // No id at all
        assert!(router
            .handle_request(&json!({ "jsonrpc": "2.0", "method": "tools/list" }))
            .is_none());
        // notifications/ prefix with an id
        assert!(router
            .handle_request(&json!({
                "jsonrpc": "2.0", "id": 5, "method": "notifications/initialized",
            }))
            .is_none());
    }

    #[test]
    fn test_unknown_method_errors() {
        let router = RequestRouter::new(None);
        let reply = router
            .handle_request(&json!({ "jsonrpc": "2.0", "id": 3, "method": "bogus/thing" }))
            .unwrap();
        assert_eq!(reply["error"]["code"], INTERNAL_ERROR);
    }

    #[test]
    fn test_unparseable_id_echoes_zero() {
        let router = RequestRouter::new(None);
        let reply = router
            .handle_request(&json!({
                "jsonrpc": "2.0", "id": {"weird": true}, "method": "unknown",
            }))
            .unwrap();
        assert_eq!(reply["id"], 0);
    }

    #[test]
    fn test_parse_error_line() {
        let router = RequestRouter::new(None);
        let reply: Value =
            serde_json::from_str(&router.handle_line("this is not json").unwrap()).unwrap();
        assert_eq!(reply["error"]["code"], PARSE_ERROR);
        assert_eq!(reply["id"], 0);
    }

    #[test]
    fn test_end_to_end_snapshot_flow() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "hello").unwrap();
        fs::create_dir_all(dir.path().join("b")).unwrap();
        fs::write(dir.path().join("b/c.py"), "print(1)").unwrap();

        let router = RequestRouter::new(None);
        init_project(&router, &dir);

        let reply = call(
            &router,
            2,
            "create_snapshot",
            json!({
                "project_path": dir.path().to_string_lossy(),
                "message": "first",
                "tag": "v1",
            }),
        );
        let text = result_text(&reply);
        assert!(text.contains("Snapshot ID: 1"), "text was: {}", text);
        assert_eq!(reply["result"]["files_count"], 2);

        // Unchanged tree responds softly, not with a tool error
        let reply = call(
            &router,
            3,
            "create_snapshot",
            json!({ "project_path": dir.path().to_string_lossy(), "tag": "v3" }),
        );
        assert!(result_text(&reply).contains("No changes detected"));
        assert!(reply["result"].get("isError").is_none());

        let reply = call(
            &router,
            4,
            "list_snapshots",
            json!({ "project_path": dir.path().to_string_lossy() }),
        );
        assert_eq!(reply["result"]["snapshots"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_diff_and_restore_flow() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "hello").unwrap();
        fs::create_dir_all(dir.path().join("b")).unwrap();
        fs::write(dir.path().join("b/c.py"), "print(1)").unwrap();

        let router = RequestRouter::new(None);
        init_project(&router, &dir);
        call(
            &router,
            2,
            "create_snapshot",
            json!({ "project_path": dir.path().to_string_lossy(), "tag": "v1" }),
        );

        fs::write(dir.path().join("a.txt"), "hello!").unwrap();
        call(
            &router,
            3,
            "create_snapshot",
            json!({ "project_path": dir.path().to_string_lossy(), "tag": "v2" }),
        );

        let reply = call(
            &router,
            4,
            "diff_versions",
            json!({
                "project_path": dir.path().to_string_lossy(),
                "from_ref": "v1",
                "to_ref": "v2",
            }),
        );
        assert_eq!(reply["result"]["total_changes"], 1);
        assert_eq!(reply["result"]["significance"], 0.5);

        fs::remove_file(dir.path().join("a.txt")).unwrap();
        let reply = call(
            &router,
            5,
            "restore_files",
            json!({
                "project_path": dir.path().to_string_lossy(),
                "snapshot_ref": "v1",
                "file_filters": ["a.txt"],
                "force": true,
            }),
        );
        assert_eq!(reply["result"]["report"]["restored"], 1);
        assert_eq!(fs::read(dir.path().join("a.txt")).unwrap(), b"hello");
    }

    #[test]
    fn test_uninitialized_project_surfaces_error_kind() {
        let dir = TempDir::new().unwrap();
        let router = RequestRouter::new(None);
        let reply = call(
            &router,
            1,
            "list_snapshots",
            json!({ "project_path": dir.path().to_string_lossy() }),
        );
        assert_eq!(reply["result"]["isError"], true);
        assert!(result_text(&reply).contains("not_initialized"));
    }

    #[test]
    fn test_unknown_tool_is_tool_error() {
        let router = RequestRouter::new(None);
        let reply = call(&router, 1, "frobnicate", json!({}));
        assert_eq!(reply["result"]["isError"], true);
        assert!(result_text(&reply).contains("Unknown tool"));
    }

    #[test]
    fn test_config_mutation_invalidates_manager_cache() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("note.txt"), "text").unwrap();
        fs::write(dir.path().join("trace.log"), "noise").unwrap();

        let router = RequestRouter::new(None);
        init_project(&router, &dir);
        call(
            &router,
            2,
            "create_snapshot",
            json!({ "project_path": dir.path().to_string_lossy(), "tag": "v1" }),
        );

        // Ignore *.log from now on; the cached manager must be rebuilt
        call(
            &router,
            3,
            "manage_ignore_rules",
            json!({
                "project_path": dir.path().to_string_lossy(),
                "action": "add",
                "rule_type": "patterns",
                "values": ["*.log"],
            }),
        );

        fs::write(dir.path().join("trace.log"), "more noise").unwrap();
        fs::write(dir.path().join("note.txt"), "edited").unwrap();
        let reply = call(
            &router,
            4,
            "create_snapshot",
            json!({ "project_path": dir.path().to_string_lossy(), "tag": "v2" }),
        );
        // Only note.txt is tracked now
        assert_eq!(reply["result"]["files_count"], 1);
    }

    #[test]
    fn test_autosave_lifecycle_via_router() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "x").unwrap();

        let router = RequestRouter::new(None);
        init_project(&router, &dir);

        let reply = call(
            &router,
            2,
            "start_autosave",
            json!({ "project_path": dir.path().to_string_lossy(), "mode": "timer" }),
        );
        assert_eq!(reply["result"]["running"], true);
        assert_eq!(reply["result"]["mode"], "timer");

        let reply = call(&router, 3, "get_autosave_status", json!({}));
        assert_eq!(reply["result"]["autosaves"].as_array().unwrap().len(), 1);

        let reply = call(
            &router,
            4,
            "stop_autosave",
            json!({ "project_path": dir.path().to_string_lossy() }),
        );
        assert_eq!(reply["result"]["running"], false);

        router.shutdown();
    }

    #[test]
    fn test_serve_line_protocol() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "x").unwrap();

        let router = RequestRouter::new(Some(dir.path().to_path_buf()));
        let input = format!(
            "{}\n{}\n{}\n",
            json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize" }),
            json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }),
            json!({
                "jsonrpc": "2.0", "id": 2, "method": "tools/call",
                "params": {
                    "name": "init_project",
                    "arguments": { "project_path": dir.path().to_string_lossy() },
                },
            }),
        );

        let mut output = Vec::new();
        router.serve(input.as_bytes(), &mut output).unwrap();

        let lines: Vec<&str> = std::str::from_utf8(&output)
            .unwrap()
            .lines()
            .collect();
        // The notification produced no reply
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["id"], 1);
        let second: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["id"], 2);
    }
}
