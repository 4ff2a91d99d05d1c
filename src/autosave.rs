//! Autosave controller
//!
//! Drives snapshot creation on a schedule without user involvement. Three
//! mutually exclusive modes:
//!
//! - **timer**: snapshot every `interval` seconds, unconditionally.
//! - **diff**: a filesystem observer raises a dirty flag; a periodic check
//!   snapshots when the working tree's change significance against the
//!   latest snapshot reaches the threshold.
//! - **hybrid**: threshold saves no sooner than `min_interval` after the
//!   last save, plus an unconditional save once `max_interval` has passed.
//!
//! Every successful trigger applies retention: autosaves beyond
//! `max_autosaves` are deleted newest-first, then autosaves older than
//! `delete_after_days` when that is positive. Manual snapshots are never
//! touched. Trigger failures are logged and the loop keeps running.

use crate::config::{AutosaveConfig, AutosaveMode};
use crate::error::Result;
use crate::types::AutosaveState;
use crate::versioning::{CreateOptions, VersionManager, CURRENT_REF};
use crate::watcher::{FsObserver, NotifyObserver};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Hybrid mode wake interval
const HYBRID_TICK: Duration = Duration::from_secs(60);
/// Granularity at which sleeping workers notice a stop request
const STOP_POLL: Duration = Duration::from_millis(200);

/// Status summary exposed through the router
#[derive(Debug, Clone, serde::Serialize)]
pub struct AutosaveStatus {
    /// Project the controller runs for
    pub project_path: String,
    /// Active mode
    pub mode: String,
    /// Whether the worker is running
    pub running: bool,
    /// Persisted bookkeeping
    pub state: AutosaveState,
}

/// Event- and time-driven snapshot loop for one project
pub struct AutosaveController {
    project_path: PathBuf,
    manager: Arc<VersionManager>,
    mode: AutosaveMode,
    dirty: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    observer: Option<NotifyObserver>,
}

impl std::fmt::Debug for AutosaveController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutosaveController")
            .field("project_path", &self.project_path)
            .field("mode", &self.mode)
            .field("running", &self.is_running())
            .field("dirty", &self.dirty.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl AutosaveController {
    /// Start the loop in the configured mode, or in `mode_override`
    pub fn start(
        manager: Arc<VersionManager>,
        config: AutosaveConfig,
        mode_override: Option<AutosaveMode>,
    ) -> Result<Self> {
        let mode = mode_override.unwrap_or(config.mode);
        let project_path = manager.project_path().to_path_buf();
        let dirty = Arc::new(AtomicBool::new(false));
        let running = Arc::new(AtomicBool::new(true));

        // Timer mode needs no observer; the other modes watch the tree
        let observer = match mode {
            AutosaveMode::Timer => None,
            AutosaveMode::Diff | AutosaveMode::Hybrid => {
                let mut observer = NotifyObserver::new(manager.storage_dir().to_path_buf());
                let flag = Arc::clone(&dirty);
                observer.start(
                    &project_path,
                    Box::new(move |_| {
                        flag.store(true, Ordering::SeqCst);
                    }),
                )?;
                Some(observer)
            }
        };

        let worker = {
            let manager = Arc::clone(&manager);
            let config = config.clone();
            let dirty = Arc::clone(&dirty);
            let running = Arc::clone(&running);
            std::thread::Builder::new()
                .name(format!("autosave-{}", mode_label(mode)))
                .spawn(move || run_loop(manager, config, mode, dirty, running))
                .map_err(|e| crate::error::SnapError::internal(format!("spawn failed: {}", e)))?
        };

        info!(
            project = %project_path.display(),
            mode = mode_label(mode),
            "autosave started"
        );

        Ok(Self {
            project_path,
            manager,
            mode,
            dirty,
            running,
            worker: Some(worker),
            observer,
        })
    }

    /// Whether the worker loop is alive
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Active mode label
    pub fn mode(&self) -> &'static str {
        mode_label(self.mode)
    }

    /// Current status including persisted bookkeeping
    pub fn status(&self) -> Result<AutosaveStatus> {
        Ok(AutosaveStatus {
            project_path: self.project_path.display().to_string(),
            mode: mode_label(self.mode).to_string(),
            running: self.is_running(),
            state: self.manager.database().autosave_state()?,
        })
    }

    /// Stop the worker and the observer, joining both promptly
    ///
    /// An in-flight snapshot creation finishes its transaction; only the
    /// loop around it is interrupted.
    pub fn stop(&mut self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(mut observer) = self.observer.take() {
            observer.stop()?;
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("autosave worker panicked before join");
            }
        }

        info!(project = %self.project_path.display(), "autosave stopped");
        Ok(())
    }

    #[cfg(test)]
    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }
}

impl Drop for AutosaveController {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn mode_label(mode: AutosaveMode) -> &'static str {
    match mode {
        AutosaveMode::Timer => "timer",
        AutosaveMode::Diff => "diff",
        AutosaveMode::Hybrid => "hybrid",
    }
}

fn run_loop(
    manager: Arc<VersionManager>,
    config: AutosaveConfig,
    mode: AutosaveMode,
    dirty: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
) {
    let wake_every = match mode {
        AutosaveMode::Timer => Duration::from_secs(config.timer.interval.max(1)),
        AutosaveMode::Diff => Duration::from_secs(config.diff_threshold.check_interval.max(1)),
        AutosaveMode::Hybrid => HYBRID_TICK,
    };

    while sleep_while_running(&running, wake_every) {
        let tick = match mode {
            AutosaveMode::Timer => timer_tick(&manager, &config),
            AutosaveMode::Diff => diff_tick(&manager, &config, &dirty),
            AutosaveMode::Hybrid => hybrid_tick(&manager, &config, &dirty),
        };
        if let Err(err) = tick {
            // A failed trigger never stops the loop
            error!(%err, "autosave tick failed");
        }
    }

    debug!("autosave loop exited");
}

/// Sleep in small slices so a stop request is noticed promptly
fn sleep_while_running(running: &AtomicBool, duration: Duration) -> bool {
    let mut remaining = duration;
    while !remaining.is_zero() {
        if !running.load(Ordering::SeqCst) {
            return false;
        }
        let slice = remaining.min(STOP_POLL);
        std::thread::sleep(slice);
        remaining = remaining.saturating_sub(slice);
    }
    running.load(Ordering::SeqCst)
}

fn timer_tick(manager: &VersionManager, config: &AutosaveConfig) -> Result<()> {
    trigger_snapshot(manager, config, "timer")?;
    Ok(())
}

fn diff_tick(
    manager: &VersionManager,
    config: &AutosaveConfig,
    dirty: &AtomicBool,
) -> Result<()> {
    let mut state = manager.database().autosave_state()?;
    state.last_check = Some(Utc::now());
    manager.database().update_autosave_state(&state)?;

    if !dirty.load(Ordering::SeqCst) {
        return Ok(());
    }

    let significance = current_significance(manager)?;
    if significance >= config.diff_threshold.threshold {
        trigger_snapshot(manager, config, "diff_threshold")?;
        dirty.store(false, Ordering::SeqCst);
    }
    Ok(())
}

fn hybrid_tick(
    manager: &VersionManager,
    config: &AutosaveConfig,
    dirty: &AtomicBool,
) -> Result<()> {
    let mut state = manager.database().autosave_state()?;
    state.last_check = Some(Utc::now());
    manager.database().update_autosave_state(&state)?;

    let elapsed = state
        .last_save
        .map(|t| (Utc::now() - t).num_seconds().max(0) as u64)
        .unwrap_or(u64::MAX);

    if elapsed >= config.hybrid.max_interval {
        trigger_snapshot(manager, config, "hybrid_max_interval")?;
        return Ok(());
    }

    if elapsed >= config.hybrid.min_interval && dirty.load(Ordering::SeqCst) {
        let significance = current_significance(manager)?;
        if significance >= config.hybrid.threshold {
            trigger_snapshot(manager, config, "hybrid_threshold")?;
            dirty.store(false, Ordering::SeqCst);
        }
    }
    Ok(())
}

/// Significance of the working tree against the latest snapshot; a project
/// with no snapshots yet counts as fully changed
fn current_significance(manager: &VersionManager) -> Result<f64> {
    match manager.database().get_latest_snapshot()? {
        Some(latest) => {
            let diff = manager.diff(&latest.id.to_string(), CURRENT_REF, None)?;
            Ok(diff.significance)
        }
        None => Ok(1.0),
    }
}

/// Create one autosave snapshot and apply retention
///
/// An unchanged tree is a quiet no-op, not a failure.
fn trigger_snapshot(
    manager: &VersionManager,
    config: &AutosaveConfig,
    trigger: &str,
) -> Result<bool> {
    let result = manager.create_snapshot(CreateOptions {
        is_autosave: true,
        trigger_type: trigger.to_string(),
        ..Default::default()
    });

    let snapshot = match result {
        Ok(snapshot) => snapshot,
        Err(crate::error::SnapError::NoChanges) => {
            debug!(trigger, "autosave skipped, no changes");
            return Ok(false);
        }
        Err(err) => return Err(err),
    };

    info!(
        id = snapshot.metadata.id,
        trigger,
        files = snapshot.metadata.files_count,
        "autosave snapshot created"
    );

    let mut state = manager.database().autosave_state()?;
    state.last_save = Some(Utc::now());
    state.last_snapshot_id = Some(snapshot.metadata.id);
    state.files_tracked = snapshot.metadata.files_count;
    manager.database().update_autosave_state(&state)?;

    apply_retention(manager, config);
    Ok(true)
}

/// Retention never touches manual snapshots and never fails the caller
fn apply_retention(manager: &VersionManager, config: &AutosaveConfig) {
    match manager.cleanup_old_autosaves(config.retention.max_autosaves) {
        Ok(0) => {}
        Ok(deleted) => debug!(deleted, "retention pruned autosaves"),
        Err(err) => error!(%err, "retention prune failed"),
    }

    if config.retention.delete_after_days > 0 {
        if let Err(err) = manager.cleanup_expired_autosaves(config.retention.delete_after_days) {
            error!(%err, "expired-autosave prune failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProjectConfig;
    use std::fs;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (Arc<VersionManager>, AutosaveConfig) {
        let config = ProjectConfig::for_project(dir.path().to_path_buf());
        let manager = Arc::new(VersionManager::init(&config).unwrap());
        (manager, config.autosave)
    }

    #[test]
    fn test_trigger_creates_autosave_and_updates_state() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "v1").unwrap();
        let (manager, config) = setup(&dir);

        assert!(trigger_snapshot(&manager, &config, "timer").unwrap());

        let snapshots = manager.list_snapshots(None, true).unwrap();
        assert_eq!(snapshots.len(), 1);
        assert!(snapshots[0].is_autosave);
        assert_eq!(snapshots[0].trigger_type, "timer");

        let state = manager.database().autosave_state().unwrap();
        assert_eq!(state.last_snapshot_id, Some(1));
        assert_eq!(state.files_tracked, 1);
    }

    #[test]
    fn test_trigger_no_changes_is_quiet() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "v1").unwrap();
        let (manager, config) = setup(&dir);

        assert!(trigger_snapshot(&manager, &config, "timer").unwrap());
        assert!(!trigger_snapshot(&manager, &config, "timer").unwrap());
        assert_eq!(manager.list_snapshots(None, true).unwrap().len(), 1);
    }

    #[test]
    fn test_retention_bounds_autosaves_keeps_manual() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "seed").unwrap();
        let (manager, mut config) = setup(&dir);
        config.retention.max_autosaves = 2;

        manager
            .create_snapshot(CreateOptions {
                message: Some("manual".to_string()),
                trigger_type: "manual".to_string(),
                ..Default::default()
            })
            .unwrap();

        for i in 0..4 {
            fs::write(dir.path().join("a.txt"), format!("edit {}", i)).unwrap();
            assert!(trigger_snapshot(&manager, &config, "hybrid_threshold").unwrap());
        }

        let (_, autosaves) = manager.database().snapshot_counts().unwrap();
        assert!(autosaves <= 2);
        let manual: Vec<_> = manager
            .list_snapshots(None, false)
            .unwrap()
            .into_iter()
            .filter(|s| !s.is_autosave)
            .collect();
        assert_eq!(manual.len(), 1);
    }

    #[test]
    fn test_diff_tick_respects_dirty_and_threshold() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "v1").unwrap();
        let (manager, mut config) = setup(&dir);
        config.diff_threshold.threshold = 0.4;

        // Baseline snapshot so significance is measured against something
        trigger_snapshot(&manager, &config, "timer").unwrap();

        let dirty = AtomicBool::new(false);
        diff_tick(&manager, &config, &dirty).unwrap();
        assert_eq!(manager.list_snapshots(None, true).unwrap().len(), 1);

        // Dirty with a change significant enough to cross the threshold
        fs::write(dir.path().join("a.txt"), "completely different").unwrap();
        dirty.store(true, Ordering::SeqCst);
        diff_tick(&manager, &config, &dirty).unwrap();
        assert_eq!(manager.list_snapshots(None, true).unwrap().len(), 2);
        assert!(!dirty.load(Ordering::SeqCst));
    }

    #[test]
    fn test_diff_tick_below_threshold_keeps_dirty() {
        let dir = TempDir::new().unwrap();
        for i in 0..10 {
            fs::write(dir.path().join(format!("f{}.txt", i)), "stable").unwrap();
        }
        let (manager, mut config) = setup(&dir);
        config.diff_threshold.threshold = 0.5;
        trigger_snapshot(&manager, &config, "timer").unwrap();

        // One file out of ten changes: significance 0.1 < 0.5
        fs::write(dir.path().join("f0.txt"), "edited").unwrap();
        let dirty = AtomicBool::new(true);
        diff_tick(&manager, &config, &dirty).unwrap();

        assert_eq!(manager.list_snapshots(None, true).unwrap().len(), 1);
        assert!(dirty.load(Ordering::SeqCst));
    }

    #[test]
    fn test_hybrid_tick_max_interval_unconditional() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "v1").unwrap();
        let (manager, mut config) = setup(&dir);
        config.hybrid.max_interval = 0;

        // last_save unset means elapsed is effectively infinite
        hybrid_tick(&manager, &config, &AtomicBool::new(false)).unwrap();
        let snaps = manager.list_snapshots(None, true).unwrap();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].trigger_type, "hybrid_max_interval");
    }

    #[test]
    fn test_hybrid_tick_threshold_path() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "v1").unwrap();
        let (manager, mut config) = setup(&dir);
        config.hybrid.min_interval = 0;
        config.hybrid.max_interval = 3600;
        config.hybrid.threshold = 0.2;

        trigger_snapshot(&manager, &config, "timer").unwrap();

        fs::write(dir.path().join("a.txt"), "changed a lot").unwrap();
        let dirty = AtomicBool::new(true);
        hybrid_tick(&manager, &config, &dirty).unwrap();

        let snaps = manager.list_snapshots(None, true).unwrap();
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].trigger_type, "hybrid_threshold");
        assert!(!dirty.load(Ordering::SeqCst));
    }

    #[test]
    fn test_controller_start_stop() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "v1").unwrap();
        let (manager, mut config) = setup(&dir);
        config.timer.interval = 3600;

        let mut controller =
            AutosaveController::start(manager, config, Some(AutosaveMode::Timer)).unwrap();
        assert!(controller.is_running());
        assert_eq!(controller.mode(), "timer");

        controller.stop().unwrap();
        assert!(!controller.is_running());
        // Stopping twice is fine
        controller.stop().unwrap();
    }

    #[test]
    fn test_controller_observer_sets_dirty() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "v1").unwrap();
        let (manager, mut config) = setup(&dir);
        config.diff_threshold.check_interval = 3600;

        let mut controller =
            AutosaveController::start(manager, config, Some(AutosaveMode::Diff)).unwrap();
        controller.mark_dirty();
        assert!(controller.dirty.load(Ordering::SeqCst));
        controller.stop().unwrap();
    }
}
