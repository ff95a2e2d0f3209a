use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use eyre::{Context, Result};
use notify::{RecursiveMode, Watcher};
use tokio::sync::{Mutex, mpsc};

use crate::{
    core::model::ConfigDump,
    error::SyncError,
    ports::config_store::ConfigStore,
    sync::{
        diff::diff_dumps,
        event::{DEFAULT_ROOT, StoreNotification},
    },
};

/// Editors tend to write a file in several steps; changes arriving within this
/// window are folded into one reload.
const SETTLE_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy)]
enum FileSignal {
    Changed,
    WatchFailed,
}

/// Store backed by a JSON routing dump on disk. The file is watched and every
/// rewrite is diffed against the previous content into change events.
pub struct FileConfigStore {
    path: PathBuf,
    last: Arc<Mutex<ConfigDump>>,
    // Kept alive for as long as the store exists
    _watcher: notify::RecommendedWatcher,
    notifications: std::sync::Mutex<Option<mpsc::Receiver<StoreNotification>>>,
}

impl FileConfigStore {
    /// Must be called from within a tokio runtime.
    pub fn new(path: impl Into<PathBuf>, capacity: usize) -> Result<Self> {
        let path = path.into();
        let (signal_tx, signal_rx) = mpsc::channel(16);
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let last = Arc::new(Mutex::new(ConfigDump::default()));

        let watcher = Self::init_watcher(&path, signal_tx)?;
        tokio::spawn(Self::follow(path.clone(), Arc::clone(&last), signal_rx, tx));

        Ok(Self {
            path,
            last,
            _watcher: watcher,
            notifications: std::sync::Mutex::new(Some(rx)),
        })
    }

    fn init_watcher(path: &Path, signals: mpsc::Sender<FileSignal>) -> Result<notify::RecommendedWatcher> {
        let file_name = path
            .file_name()
            .ok_or_else(|| eyre::eyre!("Invalid routing dump path: {}", path.display()))?
            .to_owned();

        let mut watcher =
            notify::recommended_watcher(move |res: std::result::Result<notify::Event, notify::Error>| {
                match res {
                    Ok(event) => {
                        if (event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove())
                            && event.paths.iter().any(|p| p.file_name() == Some(&file_name))
                        {
                            tracing::debug!("Routing dump changed: {:?}", event.kind);
                            // A pending signal already covers this change
                            let _ = signals.try_send(FileSignal::Changed);
                        }
                    }
                    Err(e) => {
                        tracing::error!("Routing dump watch error: {:?}", e);
                        let _ = signals.try_send(FileSignal::WatchFailed);
                    }
                }
            })?;

        let watch_dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        watcher
            .watch(watch_dir, RecursiveMode::NonRecursive)
            .wrap_err("Failed to watch routing dump directory")?;
        Ok(watcher)
    }

    async fn follow(
        path: PathBuf,
        last: Arc<Mutex<ConfigDump>>,
        mut signals: mpsc::Receiver<FileSignal>,
        tx: mpsc::Sender<StoreNotification>,
    ) {
        while let Some(signal) = signals.recv().await {
            tokio::time::sleep(SETTLE_DELAY).await;
            let mut watch_failed = matches!(signal, FileSignal::WatchFailed);
            while let Ok(extra) = signals.try_recv() {
                watch_failed |= matches!(extra, FileSignal::WatchFailed);
            }

            if watch_failed {
                // Events may have been lost; let the synchronizer reload
                if tx.send(StoreNotification::Resync).await.is_err() {
                    break;
                }
                continue;
            }

            let next = match read_dump(&path).await {
                Ok(dump) => dump,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable routing dump; keeping previous configuration");
                    continue;
                }
            };

            let mut last = last.lock().await;
            let events = match diff_dumps(DEFAULT_ROOT, &last, &next) {
                Ok(events) => events,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to diff routing dump");
                    continue;
                }
            };
            tracing::info!(path = %path.display(), changes = events.len(), "Routing dump reloaded");
            *last = next;
            for event in events {
                if tx.send(StoreNotification::Change(event)).await.is_err() {
                    return;
                }
            }
        }
        tracing::debug!("Routing dump watcher stopped");
    }
}

async fn read_dump(path: &Path) -> Result<ConfigDump, SyncError> {
    let raw = tokio::fs::read(path)
        .await
        .map_err(|e| SyncError::Store(format!("failed to read {}: {e}", path.display())))?;
    serde_json::from_slice(&raw)
        .map_err(|e| SyncError::Store(format!("failed to decode {}: {e}", path.display())))
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn load_all(&self) -> Result<ConfigDump, SyncError> {
        let dump = read_dump(&self.path).await?;
        *self.last.lock().await = dump.clone();
        Ok(dump)
    }

    fn subscribe(&self) -> Result<mpsc::Receiver<StoreNotification>, SyncError> {
        self.notifications
            .lock()
            .map_err(|_| SyncError::Store("file store lock poisoned".to_string()))?
            .take()
            .ok_or_else(|| SyncError::Store("file store already has a subscriber".to_string()))
    }
}
