//! File watching for automatic configuration reloads.

use crate::error::{ConfigError, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Watches configuration files and emits one debounced signal per burst of
/// modifications.
///
/// The parent directory of each file is watched rather than the file itself,
/// so editors that save by writing a temporary file and renaming it over the
/// original keep triggering reloads.
///
/// ```rust,no_run
/// use hotswap_registry::notify::ConfigWatcher;
/// use std::time::Duration;
///
/// # async fn example() -> hotswap_registry::error::Result<()> {
/// let (watcher, mut rx) = ConfigWatcher::new(Duration::from_millis(500))?;
/// watcher.watch("config/test/config.yaml")?;
///
/// while rx.recv().await.is_some() {
///     println!("config file changed");
/// }
/// # Ok(())
/// # }
/// ```
pub struct ConfigWatcher {
    watcher: Mutex<RecommendedWatcher>,
    files: Arc<RwLock<Vec<PathBuf>>>,
    dirs: Mutex<HashSet<PathBuf>>,
    debounce: Duration,
}

impl ConfigWatcher {
    /// Create a watcher and the receiver its reload signals arrive on.
    ///
    /// Must be called inside a tokio runtime; the debounce loop runs on a
    /// spawned task that ends when the receiver is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform watcher cannot be created.
    pub fn new(debounce: Duration) -> Result<(Self, mpsc::Receiver<()>)> {
        let (signal_tx, signal_rx) = mpsc::channel(1);
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<()>();
        let files: Arc<RwLock<Vec<PathBuf>>> = Arc::new(RwLock::new(Vec::new()));

        let watched = Arc::clone(&files);
        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(error = %e, "config watch error");
                    return;
                }
            };
            if !matches!(
                event.kind,
                EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
            ) {
                return;
            }
            let files = watched.read();
            if event.paths.iter().any(|p| files.contains(p)) {
                let _ = event_tx.send(());
            }
        })
        .map_err(|e| ConfigError::WatchError(format!("cannot create file watcher: {}", e)))?;

        // Trailing-edge debounce: wait for a quiet period, then signal once.
        tokio::spawn(async move {
            while event_rx.recv().await.is_some() {
                loop {
                    match tokio::time::timeout(debounce, event_rx.recv()).await {
                        Ok(Some(())) => continue,
                        Ok(None) => return,
                        Err(_) => break,
                    }
                }
                // A full channel already holds a pending reload.
                if let Err(mpsc::error::TrySendError::Closed(())) = signal_tx.try_send(()) {
                    return;
                }
            }
        });

        Ok((
            Self {
                watcher: Mutex::new(watcher),
                files,
                dirs: Mutex::new(HashSet::new()),
                debounce,
            },
            signal_rx,
        ))
    }

    /// Start watching `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file's directory does not exist or cannot be
    /// watched.
    pub fn watch(&self, path: impl AsRef<Path>) -> Result<()> {
        let (dir, file) = resolve(path.as_ref())?;

        let mut dirs = self.dirs.lock();
        if !dirs.contains(&dir) {
            self.watcher
                .lock()
                .watch(&dir, RecursiveMode::NonRecursive)
                .map_err(|e| {
                    ConfigError::WatchError(format!("cannot watch {}: {}", dir.display(), e))
                })?;
            dirs.insert(dir);
        }

        let mut files = self.files.write();
        if !files.contains(&file) {
            tracing::debug!(path = %file.display(), "watching config file");
            files.push(file);
        }
        Ok(())
    }

    /// Stop reacting to changes of `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the path cannot be resolved.
    pub fn unwatch(&self, path: impl AsRef<Path>) -> Result<()> {
        let (_, file) = resolve(path.as_ref())?;
        self.files.write().retain(|p| p != &file);
        Ok(())
    }

    /// Quiet period required before a burst of events produces a signal.
    pub fn debounce_duration(&self) -> Duration {
        self.debounce
    }

    /// Files currently watched, as absolute paths.
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        self.files.read().clone()
    }
}

fn resolve(path: &Path) -> Result<(PathBuf, PathBuf)> {
    let name = path
        .file_name()
        .ok_or_else(|| ConfigError::WatchError(format!("{} is not a file path", path.display())))?;
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let dir = parent
        .canonicalize()
        .map_err(|e| ConfigError::WatchError(format!("cannot resolve {}: {}", parent.display(), e)))?;
    let file = dir.join(name);
    Ok((dir, file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_watch_and_unwatch() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.yaml");
        fs::write(&path, "server:\n  addr: \":9090\"\n").unwrap();

        let (watcher, _rx) = ConfigWatcher::new(Duration::from_millis(50)).unwrap();
        watcher.watch(&path).unwrap();
        watcher.watch(&path).unwrap();
        assert_eq!(watcher.watched_paths().len(), 1);

        watcher.unwatch(&path).unwrap();
        assert!(watcher.watched_paths().is_empty());
    }

    #[tokio::test]
    async fn test_missing_directory() {
        let (watcher, _rx) = ConfigWatcher::new(Duration::from_millis(50)).unwrap();
        assert!(watcher.watch("/nonexistent/dir/config.yaml").is_err());
    }

    #[tokio::test]
    async fn test_burst_of_writes_yields_a_signal() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.yaml");
        fs::write(&path, "server:\n  addr: \":9090\"\n").unwrap();

        let (watcher, mut rx) = ConfigWatcher::new(Duration::from_millis(100)).unwrap();
        watcher.watch(&path).unwrap();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            for port in 9091..9094 {
                fs::write(&path, format!("server:\n  addr: \":{port}\"\n")).unwrap();
            }
        });

        let signal = timeout(Duration::from_secs(3), rx.recv()).await;
        assert!(matches!(signal, Ok(Some(()))));
    }

    #[tokio::test]
    async fn test_sibling_files_are_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.yaml");
        fs::write(&path, "a: 1\n").unwrap();

        let (watcher, mut rx) = ConfigWatcher::new(Duration::from_millis(50)).unwrap();
        watcher.watch(&path).unwrap();

        fs::write(temp_dir.path().join("other.yaml"), "b: 2\n").unwrap();

        let signal = timeout(Duration::from_millis(500), rx.recv()).await;
        assert!(signal.is_err());
    }
}
