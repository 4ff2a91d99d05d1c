//! Snapshot diffing and rendering
//!
//! Computes the added / removed / modified sets between two snapshot file
//! maps, scores their significance, and renders the result as a unified
//! line diff, structured JSON, or Markdown. The unified renderer uses an
//! LCS-based line diff with configurable context, the same shape git
//! produces for text files.

use crate::types::FileEntry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One modified file inside a diff
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffEntry {
    /// Project-relative path
    pub path: String,
    /// Content hash on the from side
    pub old_hash: String,
    /// Content hash on the to side
    pub new_hash: String,
}

/// Difference between two snapshots (or a snapshot and the working tree)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotDiff {
    /// Source snapshot id
    pub from_snapshot: i64,
    /// Target snapshot id; zero when the target is the live working tree
    pub to_snapshot: i64,
    /// Paths present only on the to side, sorted
    pub files_added: Vec<String>,
    /// Paths present only on the from side, sorted
    pub files_removed: Vec<String>,
    /// Paths on both sides with differing content hashes, sorted by path
    pub files_modified: Vec<DiffEntry>,
    /// |added| + |removed| + |modified|
    pub total_changes: usize,
    /// total_changes / max(|from|, |to|, 1)
    pub significance: f64,
}

impl SnapshotDiff {
    /// Compute the diff between two file lists
    pub fn compute(
        from_id: i64,
        to_id: i64,
        from_files: &[FileEntry],
        to_files: &[FileEntry],
    ) -> Self {
        let from: BTreeMap<&str, &FileEntry> =
            from_files.iter().map(|f| (f.path.as_str(), f)).collect();
        let to: BTreeMap<&str, &FileEntry> =
            to_files.iter().map(|f| (f.path.as_str(), f)).collect();

        let files_added: Vec<String> = to
            .keys()
            .filter(|p| !from.contains_key(*p))
            .map(|p| p.to_string())
            .collect();

        let files_removed: Vec<String> = from
            .keys()
            .filter(|p| !to.contains_key(*p))
            .map(|p| p.to_string())
            .collect();

        let files_modified: Vec<DiffEntry> = from
            .iter()
            .filter_map(|(path, old)| {
                let new = to.get(path)?;
                (old.hash != new.hash).then(|| DiffEntry {
                    path: path.to_string(),
                    old_hash: old.hash.clone(),
                    new_hash: new.hash.clone(),
                })
            })
            .collect();

        let total_changes = files_added.len() + files_removed.len() + files_modified.len();
        let denominator = from.len().max(to.len()).max(1);

        Self {
            from_snapshot: from_id,
            to_snapshot: to_id,
            files_added,
            files_removed,
            files_modified,
            total_changes,
            significance: total_changes as f64 / denominator as f64,
        }
    }

    /// Whether anything changed at all
    pub fn has_changes(&self) -> bool {
        self.total_changes > 0
    }

    /// Restrict the diff to paths matching the given filters
    ///
    /// The filtered significance is measured against the unfiltered change
    /// count, so narrowing the view also narrows the score.
    pub fn filter_by_paths(&self, filters: &[String]) -> Self {
        use crate::types::path_matches_any;

        let files_added: Vec<String> = self
            .files_added
            .iter()
            .filter(|p| path_matches_any(p, filters))
            .cloned()
            .collect();
        let files_removed: Vec<String> = self
            .files_removed
            .iter()
            .filter(|p| path_matches_any(p, filters))
            .cloned()
            .collect();
        let files_modified: Vec<DiffEntry> = self
            .files_modified
            .iter()
            .filter(|e| path_matches_any(&e.path, filters))
            .cloned()
            .collect();

        let total_changes = files_added.len() + files_removed.len() + files_modified.len();
        let significance = total_changes as f64 / self.total_changes.max(1) as f64;

        Self {
            from_snapshot: self.from_snapshot,
            to_snapshot: self.to_snapshot,
            files_added,
            files_removed,
            files_modified,
            total_changes,
            significance,
        }
    }
}

/// Output format for diff rendering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffFormat {
    /// Unified line diff
    Unified,
    /// Structured JSON
    Json,
    /// Human/LLM-oriented Markdown
    Markdown,
    /// Reserved; renders unified output behind a preamble
    Ast,
}

impl std::str::FromStr for DiffFormat {
    type Err = crate::error::SnapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unified" => Ok(DiffFormat::Unified),
            "json" => Ok(DiffFormat::Json),
            "markdown" => Ok(DiffFormat::Markdown),
            "ast" => Ok(DiffFormat::Ast),
            other => Err(crate::error::SnapError::invalid(format!(
                "unknown diff format: {}",
                other
            ))),
        }
    }
}

/// Old and new text of one modified file, resolved by the caller
#[derive(Debug, Clone)]
pub struct ModifiedFileText {
    /// Project-relative path
    pub path: String,
    /// Text on the from side; None when binary or missing
    pub old_text: Option<String>,
    /// Text on the to side; None when binary or missing
    pub new_text: Option<String>,
}

// ── unified rendering ──────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Hunk {
    old_start: usize,
    old_count: usize,
    new_start: usize,
    new_count: usize,
    lines: Vec<String>,
}

#[derive(Debug, Clone)]
enum ChangeOp {
    Keep(usize, usize),
    Delete(usize),
    Insert(usize),
}

/// Render a whole diff in unified format
///
/// Added and removed files appear as one-line markers; each modified file
/// gets standard `---`/`+++` headers and LCS hunks with `context` lines of
/// surrounding text. Files without resolvable text are marked binary.
pub fn render_unified(
    diff: &SnapshotDiff,
    texts: &[ModifiedFileText],
    context: usize,
) -> String {
    let mut out = String::new();

    for path in &diff.files_added {
        out.push_str(&format!("added: {}\n", path));
    }
    for path in &diff.files_removed {
        out.push_str(&format!("removed: {}\n", path));
    }
    if (!diff.files_added.is_empty() || !diff.files_removed.is_empty())
        && !diff.files_modified.is_empty()
    {
        out.push('\n');
    }

    for text in texts {
        out.push_str(&format!("--- a/{}\n+++ b/{}\n", text.path, text.path));
        match (&text.old_text, &text.new_text) {
            (Some(old), Some(new)) => {
                for hunk in compute_hunks(old, new, context) {
                    out.push_str(&format!(
                        "@@ -{},{} +{},{} @@\n",
                        hunk.old_start, hunk.old_count, hunk.new_start, hunk.new_count
                    ));
                    for line in &hunk.lines {
                        out.push_str(line);
                        out.push('\n');
                    }
                }
            }
            _ => out.push_str("Binary files differ\n"),
        }
    }

    out
}

/// Render the unified output behind the AST-format preamble
pub fn render_ast(diff: &SnapshotDiff, texts: &[ModifiedFileText], context: usize) -> String {
    format!(
        "AST diff is not available; showing unified diff.\n\n{}",
        render_unified(diff, texts, context)
    )
}

/// Render the diff as Markdown
pub fn render_markdown(diff: &SnapshotDiff) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "## Diff: snapshot {} → {}\n\n",
        diff.from_snapshot,
        if diff.to_snapshot == 0 {
            "current".to_string()
        } else {
            diff.to_snapshot.to_string()
        }
    ));

    if !diff.files_added.is_empty() {
        out.push_str("### Added\n\n");
        for path in &diff.files_added {
            out.push_str(&format!("- `{}`\n", path));
        }
        out.push('\n');
    }
    if !diff.files_modified.is_empty() {
        out.push_str("### Modified\n\n");
        for entry in &diff.files_modified {
            out.push_str(&format!("- `{}`\n", entry.path));
        }
        out.push('\n');
    }
    if !diff.files_removed.is_empty() {
        out.push_str("### Removed\n\n");
        for path in &diff.files_removed {
            out.push_str(&format!("- `{}`\n", path));
        }
        out.push('\n');
    }

    out.push_str(&format!(
        "**{} change(s)**, significance {:.2}\n",
        diff.total_changes, diff.significance
    ));
    out
}

/// Render a Keep-a-Changelog style Markdown document for a diff
pub fn render_changelog(
    diff: &SnapshotDiff,
    from_label: &str,
    to_label: &str,
    to_date: DateTime<Utc>,
) -> String {
    let mut out = String::new();
    out.push_str("# Changelog\n\n");
    out.push_str(&format!(
        "## [{}] - {}\n\n",
        to_label,
        to_date.format("%Y-%m-%d")
    ));
    out.push_str(&format!("Compared with [{}].\n\n", from_label));

    let section = |title: &str, paths: &[String]| {
        if paths.is_empty() {
            return String::new();
        }
        let mut sorted: Vec<&String> = paths.iter().collect();
        sorted.sort();
        let mut s = format!("### {}\n\n", title);
        for path in sorted {
            s.push_str(&format!("- {}\n", path));
        }
        s.push('\n');
        s
    };

    out.push_str(&section("Added", &diff.files_added));
    let modified: Vec<String> = diff.files_modified.iter().map(|e| e.path.clone()).collect();
    out.push_str(&section("Changed", &modified));
    out.push_str(&section("Removed", &diff.files_removed));

    out.push_str(&format!(
        "---\n\n{} added, {} changed, {} removed ({} total, significance {:.2})\n",
        diff.files_added.len(),
        modified.len(),
        diff.files_removed.len(),
        diff.total_changes,
        diff.significance
    ));
    out
}

fn compute_hunks(old: &str, new: &str, context: usize) -> Vec<Hunk> {
    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();

    if old_lines.is_empty() && new_lines.is_empty() {
        return Vec::new();
    }

    let changes = compute_changes(&old_lines, &new_lines);
    build_hunks(&changes, &old_lines, &new_lines, context)
}

fn compute_changes(old_lines: &[&str], new_lines: &[&str]) -> Vec<ChangeOp> {
    if old_lines.is_empty() {
        return (0..new_lines.len()).map(ChangeOp::Insert).collect();
    }
    if new_lines.is_empty() {
        return (0..old_lines.len()).map(ChangeOp::Delete).collect();
    }

    let lcs = compute_lcs(old_lines, new_lines);

    let mut changes = Vec::new();
    let mut old_idx = 0;
    let mut new_idx = 0;
    for &(lcs_old, lcs_new) in &lcs {
        while old_idx < lcs_old {
            changes.push(ChangeOp::Delete(old_idx));
            old_idx += 1;
        }
        while new_idx < lcs_new {
            changes.push(ChangeOp::Insert(new_idx));
            new_idx += 1;
        }
        changes.push(ChangeOp::Keep(old_idx, new_idx));
        old_idx += 1;
        new_idx += 1;
    }
    while old_idx < old_lines.len() {
        changes.push(ChangeOp::Delete(old_idx));
        old_idx += 1;
    }
    while new_idx < new_lines.len() {
        changes.push(ChangeOp::Insert(new_idx));
        new_idx += 1;
    }
    changes
}

/// Longest common subsequence over lines, classic O(m·n) table
fn compute_lcs(old_lines: &[&str], new_lines: &[&str]) -> Vec<(usize, usize)> {
    let m = old_lines.len();
    let n = new_lines.len();
    let mut dp = vec![vec![0usize; n + 1]; m + 1];

    for i in 1..=m {
        for j in 1..=n {
            if old_lines[i - 1] == new_lines[j - 1] {
                dp[i][j] = dp[i - 1][j - 1] + 1;
            } else {
                dp[i][j] = dp[i - 1][j].max(dp[i][j - 1]);
            }
        }
    }

    let mut lcs = Vec::new();
    let mut i = m;
    let mut j = n;
    while i > 0 && j > 0 {
        if old_lines[i - 1] == new_lines[j - 1] {
            lcs.push((i - 1, j - 1));
            i -= 1;
            j -= 1;
        } else if dp[i - 1][j] > dp[i][j - 1] {
            i -= 1;
        } else {
            j -= 1;
        }
    }
    lcs.reverse();
    lcs
}

fn build_hunks(
    changes: &[ChangeOp],
    old_lines: &[&str],
    new_lines: &[&str],
    context: usize,
) -> Vec<Hunk> {
    let mut hunks = Vec::new();
    let mut idx = 0;

    while idx < changes.len() {
        // Seek the next non-Keep change
        while idx < changes.len() && matches!(changes[idx], ChangeOp::Keep(_, _)) {
            idx += 1;
        }
        if idx >= changes.len() {
            break;
        }

        // Pull the hunk window back by `context` keeps
        let start = idx.saturating_sub(context);
        let mut end = idx;
        let mut keeps_since_change = 0;
        while end < changes.len() {
            match changes[end] {
                ChangeOp::Keep(_, _) => {
                    keeps_since_change += 1;
                    // Two context windows of keeps separate hunks
                    if keeps_since_change > context * 2 {
                        break;
                    }
                }
                _ => keeps_since_change = 0,
            }
            end += 1;
        }
        // The keep that broke the window was counted but sits past `end`
        let included_keeps = if end < changes.len() {
            keeps_since_change.saturating_sub(1)
        } else {
            keeps_since_change
        };
        let end = end - included_keeps.saturating_sub(context);

        let mut lines = Vec::new();
        let mut old_start = None;
        let mut new_start = None;
        let mut old_count = 0;
        let mut new_count = 0;
        for change in &changes[start..end] {
            match change {
                ChangeOp::Keep(o, n) => {
                    old_start.get_or_insert(*o + 1);
                    new_start.get_or_insert(*n + 1);
                    old_count += 1;
                    new_count += 1;
                    lines.push(format!(" {}", old_lines[*o]));
                }
                ChangeOp::Delete(o) => {
                    old_start.get_or_insert(*o + 1);
                    old_count += 1;
                    lines.push(format!("-{}", old_lines[*o]));
                }
                ChangeOp::Insert(n) => {
                    new_start.get_or_insert(*n + 1);
                    new_count += 1;
                    lines.push(format!("+{}", new_lines[*n]));
                }
            }
        }

        hunks.push(Hunk {
            old_start: old_start.unwrap_or(1),
            old_count,
            new_start: new_start.unwrap_or(1),
            new_count,
            lines,
        });

        idx = end;
    }

    hunks
}
