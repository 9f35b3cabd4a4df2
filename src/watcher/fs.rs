//! Native filesystem watch plus recovery when the directory disappears.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use notify::event::ModifyKind;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{Notify, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::debounce::{WatchSignal, debounce_loop};
use super::types::{ChangeKind, FileChangeEvent, WatchEvent, WatchFilter};
use crate::errors::WatchError;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub dir: PathBuf,
    pub debounce: Duration,
    pub filter: WatchFilter,
    /// Poll interval for detecting a removed or recreated directory.
    pub recovery_interval: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".beads"),
            debounce: Duration::from_millis(100),
            filter: WatchFilter::default(),
            recovery_interval: Duration::from_secs(1),
        }
    }
}

struct Running {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Watches one directory and publishes one `Changed` event per burst of
/// snapshot/journal file notifications.
///
/// `start` while running is a no-op; `stop` followed by `start` builds a
/// fresh native watch.
pub struct DebouncedFileWatcher {
    config: WatcherConfig,
    events: broadcast::Sender<WatchEvent>,
    running: Mutex<Option<Running>>,
}

impl DebouncedFileWatcher {
    pub fn new(config: WatcherConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            events,
            running: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.lock().is_some()
    }

    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    /// Start watching. Must be called inside a Tokio runtime. Returns
    /// `false` when the watcher was already running.
    pub fn start(&self) -> bool {
        let mut running = self.lock();
        if running.is_some() {
            return false;
        }

        let cancel = CancellationToken::new();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let debounce = tokio::spawn(debounce_loop(
            signals_rx,
            self.config.debounce,
            self.events.clone(),
            cancel.clone(),
        ));
        let maintain = tokio::spawn(maintain_watch(
            self.config.clone(),
            signals_tx,
            cancel.clone(),
        ));

        tracing::info!(
            dir = %self.config.dir.display(),
            debounce_ms = self.config.debounce.as_millis() as u64,
            "file watcher started"
        );
        *running = Some(Running {
            cancel,
            tasks: vec![debounce, maintain],
        });
        true
    }

    /// Tear down the native watch and drop any pending debounce.
    pub async fn stop(&self) {
        let Some(running) = self.lock().take() else {
            return;
        };
        running.cancel.cancel();
        for task in running.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "file watcher task ended abnormally");
            }
        }
        tracing::info!(dir = %self.config.dir.display(), "file watcher stopped");
    }
}

/// Keep a native watch alive on `config.dir`, re-establishing it whenever
/// the directory disappears, or is replaced, and comes back.
async fn maintain_watch(
    config: WatcherConfig,
    signals: mpsc::UnboundedSender<WatchSignal>,
    cancel: CancellationToken,
) {
    let mut reported = false;

    loop {
        // Fresh per native watch so a wake-up from a dropped watch is not
        // mistaken for one from the current watch.
        let root_changed = Arc::new(Notify::new());
        let identity = dir_identity(&config.dir);
        let watcher = if identity.is_some() {
            match open_watch(
                &config.dir,
                &config.filter,
                signals.clone(),
                Arc::clone(&root_changed),
            ) {
                Ok(watcher) => {
                    if reported {
                        tracing::info!(dir = %config.dir.display(), "file watch re-established");
                    }
                    reported = false;
                    Some(watcher)
                }
                Err(err) => {
                    if !reported {
                        let _ = signals.send(WatchSignal::Failed(err));
                        reported = true;
                    }
                    None
                }
            }
        } else {
            if !reported {
                let _ = signals.send(WatchSignal::Failed(WatchError::DirectoryMissing {
                    path: config.dir.clone(),
                }));
                reported = true;
            }
            None
        };

        loop {
            let woken = tokio::select! {
                _ = cancel.cancelled() => return,
                _ = root_changed.notified() => true,
                _ = tokio::time::sleep(config.recovery_interval) => false,
            };
            let current = dir_identity(&config.dir);
            match (&watcher, current) {
                (Some(_), Some(id)) if !woken && Some(id) == identity => continue,
                (Some(_), Some(_)) => {
                    let _ = signals.send(WatchSignal::Failed(WatchError::DirectoryReplaced {
                        path: config.dir.clone(),
                    }));
                    reported = true;
                    break;
                }
                (Some(_), None) => {
                    let _ = signals.send(WatchSignal::Failed(WatchError::DirectoryMissing {
                        path: config.dir.clone(),
                    }));
                    reported = true;
                    break;
                }
                (None, Some(_)) => break,
                (None, None) => continue,
            }
        }
        // Dropping the old watcher here releases the native handle.
        drop(watcher);
    }
}

/// Device and inode of `dir`, or `None` when it is not a directory. A
/// changed identity means the directory was replaced under the watch.
#[cfg(unix)]
fn dir_identity(dir: &Path) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;

    let meta = std::fs::metadata(dir).ok()?;
    meta.is_dir().then(|| (meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn dir_identity(dir: &Path) -> Option<(u64, u64)> {
    dir.is_dir().then_some((0, 0))
}

/// Whether a native event removed or renamed the watched directory itself.
fn affects_root(event: &notify::Event, roots: &[PathBuf]) -> bool {
    matches!(
        event.kind,
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_))
    ) && event.paths.iter().any(|path| roots.contains(path))
}

fn open_watch(
    dir: &Path,
    filter: &WatchFilter,
    signals: mpsc::UnboundedSender<WatchSignal>,
    root_changed: Arc<Notify>,
) -> Result<RecommendedWatcher, WatchError> {
    let filter = filter.clone();
    let watched = dir.to_path_buf();
    let mut roots = vec![watched.clone()];
    if let Ok(canonical) = std::fs::canonicalize(dir)
        && canonical != watched
    {
        roots.push(canonical);
    }
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        match res {
            Ok(event) => {
                if affects_root(&event, &roots) {
                    root_changed.notify_one();
                    return;
                }
                let Some(kind) = ChangeKind::from_notify(&event.kind) else {
                    return;
                };
                for path in event.paths {
                    if let Some(family) = filter.classify(&path) {
                        let _ = signals.send(WatchSignal::Change(FileChangeEvent::new(
                            path, kind, family,
                        )));
                    }
                }
            }
            Err(source) => {
                let _ = signals.send(WatchSignal::Failed(WatchError::Notify {
                    path: watched.clone(),
                    source,
                }));
            }
        }
    })
    .map_err(|source| WatchError::Notify {
        path: dir.to_path_buf(),
        source,
    })?;

    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .map_err(|source| WatchError::Notify {
            path: dir.to_path_buf(),
            source,
        })?;
    Ok(watcher)
}
