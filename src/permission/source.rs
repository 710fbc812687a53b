//! Request discovery.
//!
//! A [`RequestSource`] yields batches of `request-*.json` paths currently
//! present in the permission directory. The same file may be reported more
//! than once until it is deleted; the service deduplicates in-flight ids.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use crate::config::{BridgeConfig, WatchMode};
use crate::permission::request_id_from_file_name;
use crate::{AppError, Result};

/// Produces batches of request file paths.
pub trait RequestSource: Send {
    /// Wait for the next batch. An empty batch is allowed.
    fn next_batch<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = Vec<PathBuf>> + Send + 'a>>;
}

/// Whether `path` names a request file.
#[must_use]
pub fn is_request_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .and_then(request_id_from_file_name)
        .is_some()
}

/// List request files in `dir`, sorted by name.
///
/// A missing directory yields an empty list.
pub async fn scan_requests(dir: &Path) -> Vec<PathBuf> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) => {
            debug!(dir = %dir.display(), %err, "permission directory not readable");
            return Vec::new();
        }
    };

    let mut found = Vec::new();
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => {
                let path = entry.path();
                if is_request_file(&path) {
                    found.push(path);
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(dir = %dir.display(), %err, "error listing permission directory");
                break;
            }
        }
    }
    found.sort();
    found
}

// ── Polling ──────────────────────────────────────────────────────────────────

/// Fixed-interval directory listing.
///
/// The first batch is scanned immediately. Notifying `wake` cuts the
/// current interval short.
#[derive(Debug)]
pub struct PollingSource {
    dir: PathBuf,
    interval: Duration,
    wake: Arc<Notify>,
    started: bool,
}

impl PollingSource {
    /// Poll `dir` every `interval`.
    #[must_use]
    pub fn new(dir: PathBuf, interval: Duration, wake: Arc<Notify>) -> Self {
        Self {
            dir,
            interval,
            wake,
            started: false,
        }
    }
}

impl RequestSource for PollingSource {
    fn next_batch<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = Vec<PathBuf>> + Send + 'a>> {
        Box::pin(async move {
            if self.started {
                tokio::select! {
                    () = tokio::time::sleep(self.interval) => {}
                    () = self.wake.notified() => debug!("permission poll woken early"),
                }
            } else {
                self.started = true;
            }
            scan_requests(&self.dir).await
        })
    }
}

// ── File-system notifications ────────────────────────────────────────────────

/// `notify`-backed source with an initial scan.
pub struct NotifySource {
    dir: PathBuf,
    events: mpsc::UnboundedReceiver<PathBuf>,
    _watcher: RecommendedWatcher,
    started: bool,
}

impl std::fmt::Debug for NotifySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifySource")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl NotifySource {
    /// Watch `dir`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Permission` if the directory cannot be created or
    /// watched.
    pub fn new(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir).map_err(|err| {
            AppError::Permission(format!(
                "failed to create permission directory {}: {err}",
                dir.display()
            ))
        })?;

        let (tx, events) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(
            move |result: std::result::Result<Event, notify::Error>| match result {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                        for path in event.paths.into_iter().filter(|p| is_request_file(p)) {
                            // Receiver gone means the source was dropped.
                            let _ = tx.send(path);
                        }
                    }
                }
                Err(err) => warn!(%err, "permission watcher error"),
            },
        )
        .map_err(|err| AppError::Permission(format!("failed to create watcher: {err}")))?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|err| AppError::Permission(format!("failed to watch directory: {err}")))?;

        Ok(Self {
            dir,
            events,
            _watcher: watcher,
            started: false,
        })
    }
}

impl RequestSource for NotifySource {
    fn next_batch<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = Vec<PathBuf>> + Send + 'a>> {
        Box::pin(async move {
            if !self.started {
                self.started = true;
                return scan_requests(&self.dir).await;
            }

            let Some(first) = self.events.recv().await else {
                // Watcher gone; avoid spinning.
                std::future::pending::<()>().await;
                return Vec::new();
            };
            let mut batch = vec![first];
            while let Ok(path) = self.events.try_recv() {
                if !batch.contains(&path) {
                    batch.push(path);
                }
            }
            batch.retain(|p| p.exists());
            batch
        })
    }
}

/// Build the source selected by `permission.watch_mode`.
///
/// # Errors
///
/// Returns `AppError::Permission` if the notify watcher cannot be set up.
pub fn from_config(config: &BridgeConfig, wake: Arc<Notify>) -> Result<Box<dyn RequestSource>> {
    let dir = config.permission_dir();
    match config.permission.watch_mode {
        WatchMode::Poll => Ok(Box::new(PollingSource::new(dir, config.poll_interval(), wake))),
        WatchMode::Notify => Ok(Box::new(NotifySource::new(dir)?)),
    }
}
