//! # Configuration Hot Reload
//!
//! Watches the declarative config file and runs a callback after each stable
//! write. Editors that save through a temp file and rename are handled by
//! watching the parent directory and filtering on the file name.
//!
//! Each callback run receives a [`CancellationToken`]. When a newer change
//! lands while a run is still in flight, the old run's token is cancelled
//! before the new one starts, so the latest file content always wins.

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Quiet period a file must stay unchanged before it counts as written.
pub const DEFAULT_STABILITY_THRESHOLD: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum ConfigWatchError {
    #[error("Config file not found: {path}")]
    NotFound { path: String },

    #[error("Failed to watch config file {path}: {reason}")]
    Watch { path: String, reason: String },

    #[error("Watcher already running for {path}")]
    AlreadyRunning { path: String }
}

/// Owns the file watcher task for one config path.
///
/// # M-CANONICAL-DOCS
///
/// ## Purpose
/// Debounced, cancellable config reload. Lifecycle is explicit:
/// [`ConfigWatcher::start`] spawns the watch loop and [`ConfigWatcher::stop`]
/// tears it down, cancelling any in-flight callback.
///
/// ## Usage
/// ```rust,no_run
/// use config::ConfigWatcher;
/// use std::path::PathBuf;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let mut watcher = ConfigWatcher::new(PathBuf::from("config.json"));
/// watcher.start(|cancel| async move {
///     if cancel.is_cancelled() {
///         return;
///     }
///     // reconcile...
/// })?;
/// # Ok(())
/// # }
/// ```
pub struct ConfigWatcher {
    path: PathBuf,
    stability_threshold: Duration,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>
}

impl ConfigWatcher {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            stability_threshold: DEFAULT_STABILITY_THRESHOLD,
            shutdown: CancellationToken::new(),
            handle: None
        }
    }

    #[must_use]
    pub fn with_stability_threshold(mut self, threshold: Duration) -> Self {
        self.stability_threshold = threshold;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Start watching. `on_change` runs once immediately, then after every
    /// stable write.
    pub fn start<F, Fut>(&mut self, on_change: F) -> Result<(), ConfigWatchError>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static
    {
        let display = self.path.display().to_string();
        if self.is_running() {
            return Err(ConfigWatchError::AlreadyRunning { path: display });
        }
        if !self.path.exists() {
            return Err(ConfigWatchError::NotFound { path: display });
        }

        let file_name: OsString = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| ConfigWatchError::NotFound {
                path: display.clone()
            })?;
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from(".")
        };

        let (event_tx, mut event_rx) = tokio::sync::mpsc::channel(100);
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = event_tx.blocking_send(res);
            },
            notify::Config::default()
        )
        .map_err(|e| ConfigWatchError::Watch {
            path: display.clone(),
            reason: e.to_string()
        })?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| ConfigWatchError::Watch {
                path: display.clone(),
                reason: e.to_string()
            })?;

        info!("Watching config file: {:?}", self.path);

        let path = self.path.clone();
        let shutdown = self.shutdown.clone();
        let threshold = self.stability_threshold;

        let handle = tokio::spawn(async move {
            // Moved in so the OS watch lives as long as the loop.
            let _watcher = watcher;
            let mut in_flight: Option<CancellationToken> = None;
            let mut deadline = Some(Instant::now());

            loop {
                let pending = deadline;
                let settle = async move {
                    match pending {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending::<()>().await
                    }
                };

                tokio::select! {
                    () = shutdown.cancelled() => {
                        if let Some(token) = in_flight.take() {
                            token.cancel();
                        }
                        debug!("Stopping config watcher for {:?}", path);
                        break;
                    }
                    event = event_rx.recv() => {
                        let Some(event) = event else {
                            break;
                        };
                        match event {
                            Ok(event) => {
                                let relevant = matches!(
                                    event.kind,
                                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                                );
                                let ours = event
                                    .paths
                                    .iter()
                                    .any(|p| p.file_name() == Some(file_name.as_os_str()));
                                if relevant && ours {
                                    deadline = Some(Instant::now() + threshold);
                                }
                            }
                            Err(e) => warn!("Watch error: {}", e)
                        }
                    }
                    () = settle => {
                        deadline = None;
                        if !path.exists() {
                            warn!("Config file removed: {:?}", path);
                            continue;
                        }

                        if let Some(previous) = in_flight.take() {
                            debug!("Superseding in-flight config sync");
                            previous.cancel();
                        }

                        info!("Config file {:?} changed, syncing", path);
                        let token = shutdown.child_token();
                        in_flight = Some(token.clone());
                        tokio::spawn(on_change(token));
                    }
                }
            }
        });

        self.handle = Some(handle);
        Ok(())
    }

    /// Stop watching and cancel any in-flight callback.
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        self.shutdown = CancellationToken::new();
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn config_file(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{}").unwrap();
        path
    }

    #[tokio::test]
    async fn test_start_missing_file_fails() {
        let mut watcher = ConfigWatcher::new(PathBuf::from("/nonexistent/config.json"));
        let result = watcher.start(|_| async {});
        assert!(matches!(result, Err(ConfigWatchError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_runs_immediately_and_debounces_bursts() {
        let dir = TempDir::new().unwrap();
        let path = config_file(&dir);
        let runs = Arc::new(AtomicUsize::new(0));

        let mut watcher = ConfigWatcher::new(path.clone())
            .with_stability_threshold(Duration::from_millis(200));
        let counter = runs.clone();
        watcher
            .start(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1, "initial run");

        for i in 0..5 {
            std::fs::write(&path, format!("{{\"n\": {i}}}")).unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2, "burst collapses to one run");

        watcher.stop().await;
        assert!(!watcher.is_running());
    }

    #[tokio::test]
    async fn test_atomic_rename_triggers_reload() {
        let dir = TempDir::new().unwrap();
        let path = config_file(&dir);
        let runs = Arc::new(AtomicUsize::new(0));

        let mut watcher = ConfigWatcher::new(path.clone());
        let counter = runs.clone();
        watcher
            .start(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        let tmp = dir.path().join(".config.json.tmp");
        std::fs::write(&tmp, "{\"connections\": {}}").unwrap();
        std::fs::rename(&tmp, &path).unwrap();

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(runs.load(Ordering::SeqCst) >= 2);
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_newer_change_cancels_in_flight_run() {
        let dir = TempDir::new().unwrap();
        let path = config_file(&dir);
        let cancelled = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));

        let mut watcher = ConfigWatcher::new(path.clone());
        let (c, d) = (cancelled.clone(), completed.clone());
        watcher
            .start(move |token| {
                let (c, d) = (c.clone(), d.clone());
                async move {
                    tokio::select! {
                        () = token.cancelled() => { c.fetch_add(1, Ordering::SeqCst); }
                        () = tokio::time::sleep(Duration::from_secs(30)) => { d.fetch_add(1, Ordering::SeqCst); }
                    }
                }
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        std::fs::write(&path, "{\"a\": 1}").unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(cancelled.load(Ordering::SeqCst) >= 1);

        watcher.stop().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cancelled.load(Ordering::SeqCst) >= 2);
        assert_eq!(completed.load(Ordering::SeqCst), 0);
    }
}
