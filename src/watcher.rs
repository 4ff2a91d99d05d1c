//! File system observation behind a minimal interface
//!
//! The autosave loop only needs a debounced "something changed" signal, so
//! the OS-specific watcher sits behind [`FsObserver`]: start watching a
//! root, invoke a callback on relevant changes, stop. Events on
//! directories are noise for that purpose, and events under the storage
//! directory would feed the engine's own writes back into the dirty flag,
//! so both are dropped before the callback fires. Signals are debounced to
//! at most one per second, tracked entirely on the watcher's thread.

use crate::error::Result;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};

/// Debounce window between change signals
const DEBOUNCE: Duration = Duration::from_secs(1);

/// Change callback invoked with the path that triggered the signal
pub type ChangeCallback = Box<dyn Fn(&Path) + Send + Sync>;

/// Minimal observer contract the autosave controller depends on
pub trait FsObserver: Send {
    /// Begin watching `root` recursively, invoking `on_change` on file
    /// modifications outside the storage directory
    fn start(&mut self, root: &Path, on_change: ChangeCallback) -> Result<()>;

    /// Stop watching; must return promptly
    fn stop(&mut self) -> Result<()>;
}

/// [`FsObserver`] implementation over the platform's native watch API
pub struct NotifyObserver {
    storage_dir: PathBuf,
    watched_root: Option<PathBuf>,
    watcher: Option<notify::RecommendedWatcher>,
}

impl std::fmt::Debug for NotifyObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifyObserver")
            .field("storage_dir", &self.storage_dir)
            .field("watching", &self.watched_root)
            .finish()
    }
}

impl NotifyObserver {
    /// Observer that suppresses events under `storage_dir`
    pub fn new(storage_dir: PathBuf) -> Self {
        Self {
            storage_dir,
            watched_root: None,
            watcher: None,
        }
    }
}

impl FsObserver for NotifyObserver {
    fn start(&mut self, root: &Path, on_change: ChangeCallback) -> Result<()> {
        let storage_dir = self.storage_dir.clone();
        // Touched only from the notify callback thread
        let last_signal: Mutex<Option<Instant>> = Mutex::new(None);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let event = match res {
                Ok(event) => event,
                Err(err) => {
                    error!(%err, "file system watch error");
                    return;
                }
            };

            if !matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
            ) {
                return;
            }

            for path in &event.paths {
                if path.starts_with(&storage_dir) {
                    continue;
                }
                if path.is_dir() {
                    continue;
                }

                let mut last = last_signal.lock();
                let due = last.map_or(true, |t| t.elapsed() >= DEBOUNCE);
                if due {
                    *last = Some(Instant::now());
                    trace!(path = %path.display(), "change signal");
                    on_change(path);
                }
                // One signal covers the whole event batch
                break;
            }
        })?;

        watcher.watch(root, RecursiveMode::Recursive)?;
        debug!(root = %root.display(), "file system observer started");

        self.watched_root = Some(root.to_path_buf());
        self.watcher = Some(watcher);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let (Some(mut watcher), Some(root)) = (self.watcher.take(), self.watched_root.take()) {
            // Unwatch errors on teardown are not actionable
            let _ = watcher.unwatch(&root);
            debug!(root = %root.display(), "file system observer stopped");
        }
        Ok(())
    }
}

impl Drop for NotifyObserver {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn test_change_signal_fires() {
        let dir = TempDir::new().unwrap();
        let storage = dir.path().join(".gencodedoc");
        fs::create_dir_all(&storage).unwrap();

        let signals = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&signals);

        let mut observer = NotifyObserver::new(storage);
        observer
            .start(
                dir.path(),
                Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        thread::sleep(Duration::from_millis(200));
        fs::write(dir.path().join("edited.txt"), "change").unwrap();
        thread::sleep(Duration::from_millis(1500));

        assert!(signals.load(Ordering::SeqCst) >= 1);
        observer.stop().unwrap();
    }

    #[test]
    fn test_storage_dir_events_suppressed() {
        let dir = TempDir::new().unwrap();
        let storage = dir.path().join(".gencodedoc");
        fs::create_dir_all(&storage).unwrap();

        let signals = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&signals);

        let mut observer = NotifyObserver::new(storage.clone());
        observer
            .start(
                dir.path(),
                Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        thread::sleep(Duration::from_millis(200));
        fs::write(storage.join("gencodedoc.db"), "engine write").unwrap();
        thread::sleep(Duration::from_millis(1500));

        assert_eq!(signals.load(Ordering::SeqCst), 0);
        observer.stop().unwrap();
    }

    #[test]
    fn test_debounce_collapses_bursts() {
        let dir = TempDir::new().unwrap();
        let storage = dir.path().join(".gencodedoc");
        fs::create_dir_all(&storage).unwrap();

        let signals = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&signals);

        let mut observer = NotifyObserver::new(storage);
        observer
            .start(
                dir.path(),
                Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        thread::sleep(Duration::from_millis(200));
        for i in 0..20 {
            fs::write(dir.path().join(format!("f{}.txt", i)), "x").unwrap();
        }
        thread::sleep(Duration::from_millis(700));

        // A burst well inside the window produces at most one signal
        assert!(signals.load(Ordering::SeqCst) <= 1);
        observer.stop().unwrap();
    }
}
