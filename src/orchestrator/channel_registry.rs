//! Channel registry: channel id → in-flight process handle.
//!
//! A channel owns at most one live process. The registry is cheaply
//! cloneable (all state is behind `Arc<Mutex<…>>`) and is shared between the
//! send path, which registers and unregisters handles, and any caller that
//! wants to interrupt a channel.
//!
//! # Interruption
//!
//! [`ChannelRegistry::interrupt`] marks the channel as interrupted *before*
//! signalling the process, so the send path's exit accounting can tell a
//! user cancellation from a failure via [`ChannelRegistry::take_interrupted`].
//! The process first receives `SIGTERM` (unix); if it has not exited within
//! the grace period it is force-killed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

// ── Process handle ───────────────────────────────────────────────────────────

#[derive(Debug)]
struct HandleInner {
    pid: Option<u32>,
    kill: CancellationToken,
    exited: CancellationToken,
}

/// Cloneable handle to one launched process.
///
/// The [`tokio::process::Child`] itself is owned by the exit monitor task;
/// the handle only carries the pid and two tokens: `kill` (request a forced
/// kill) and `exited` (fired by the monitor once the process is reaped).
/// Two handles are equal only if they refer to the same launch.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    inner: Arc<HandleInner>,
}

impl ProcessHandle {
    /// Create a handle for a process with the given pid.
    #[must_use]
    pub fn new(pid: Option<u32>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                pid,
                kill: CancellationToken::new(),
                exited: CancellationToken::new(),
            }),
        }
    }

    /// OS process id, if known.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    /// Token cancelled when a forced kill is requested.
    #[must_use]
    pub fn kill_token(&self) -> CancellationToken {
        self.inner.kill.clone()
    }

    /// Token cancelled once the process has exited.
    #[must_use]
    pub fn exited_token(&self) -> CancellationToken {
        self.inner.exited.clone()
    }

    /// Request a forced kill.
    pub fn kill(&self) {
        self.inner.kill.cancel();
    }

    /// Record that the process has exited.
    pub fn mark_exited(&self) {
        self.inner.exited.cancel();
    }

    /// Whether the process has exited.
    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.inner.exited.is_cancelled()
    }

    /// Send a graceful termination signal.
    ///
    /// On unix this is `SIGTERM`; elsewhere there is no graceful variant and
    /// this is a no-op, leaving the forced kill to do the work.
    pub fn terminate(&self) {
        if let Some(pid) = self.inner.pid {
            send_sigterm(pid);
        }
    }

    /// Terminate gracefully, then force-kill if still running after `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        if self.has_exited() {
            return;
        }

        self.terminate();

        let exited = self.exited_token();
        if tokio::time::timeout(grace, exited.cancelled()).await.is_ok() {
            info!(pid = ?self.pid(), "process exited after graceful termination");
            return;
        }

        warn!(
            pid = ?self.pid(),
            grace_ms = grace.as_millis(),
            "process did not exit within grace period, forcing kill"
        );
        self.kill();
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        warn!(pid, "pid out of range, skipping SIGTERM");
        return;
    };
    if let Err(err) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        debug!(pid, %err, "SIGTERM failed, process likely gone");
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}

impl PartialEq for ProcessHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for ProcessHandle {}

// ── Registry ─────────────────────────────────────────────────────────────────

/// Default grace period between graceful termination and forced kill.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(3);

/// Concurrency-safe map of channel ids to live processes.
#[derive(Debug, Clone)]
pub struct ChannelRegistry {
    processes: Arc<Mutex<HashMap<String, ProcessHandle>>>,
    interrupted: Arc<Mutex<HashSet<String>>>,
    grace: Duration,
}

impl ChannelRegistry {
    /// Create an empty registry with the given kill grace period.
    #[must_use]
    pub fn new(grace: Duration) -> Self {
        Self {
            processes: Arc::new(Mutex::new(HashMap::new())),
            interrupted: Arc::new(Mutex::new(HashSet::new())),
            grace,
        }
    }

    /// Register `handle` for `channel_id`, replacing any previous handle.
    ///
    /// Returns the replaced handle, if there was one.
    pub async fn register(&self, channel_id: &str, handle: ProcessHandle) -> Option<ProcessHandle> {
        // A mark left by an interrupt that raced a natural exit must not leak
        // into the next launch on this channel.
        self.interrupted.lock().await.remove(channel_id);
        let previous = self
            .processes
            .lock()
            .await
            .insert(channel_id.to_owned(), handle);
        if previous.is_some() {
            warn!(channel_id, "channel re-registered, previous process replaced");
        } else {
            debug!(channel_id, "channel registered");
        }
        previous
    }

    /// Remove `channel_id` only if it still maps to `handle`.
    ///
    /// Returns whether an entry was removed. A late unregister for a process
    /// that has already been replaced leaves the newer entry untouched.
    pub async fn unregister(&self, channel_id: &str, handle: &ProcessHandle) -> bool {
        let mut processes = self.processes.lock().await;
        match processes.get(channel_id) {
            Some(current) if current == handle => {
                processes.remove(channel_id);
                debug!(channel_id, "channel unregistered");
                true
            }
            Some(_) => {
                debug!(channel_id, "unregister skipped, channel holds a newer process");
                false
            }
            None => false,
        }
    }

    /// Handle currently registered for `channel_id`.
    pub async fn get(&self, channel_id: &str) -> Option<ProcessHandle> {
        self.processes.lock().await.get(channel_id).cloned()
    }

    /// Number of channels with a live process.
    pub async fn len(&self) -> usize {
        self.processes.lock().await.len()
    }

    /// Whether no channel has a live process.
    pub async fn is_empty(&self) -> bool {
        self.processes.lock().await.is_empty()
    }

    /// Ids of all channels with a live process.
    pub async fn channel_ids(&self) -> Vec<String> {
        self.processes.lock().await.keys().cloned().collect()
    }

    /// Interrupt the process on `channel_id`.
    ///
    /// Unknown or already-finished channels are a logged no-op. Returns
    /// whether a process was found.
    pub async fn interrupt(&self, channel_id: &str) -> bool {
        let span = info_span!("interrupt_channel", channel_id);
        async {
            let handle = {
                let mut processes = self.processes.lock().await;
                let handle = processes.remove(channel_id);
                if handle.is_some() {
                    self.interrupted.lock().await.insert(channel_id.to_owned());
                }
                handle
            };
            let Some(handle) = handle else {
                debug!(channel_id, "interrupt: no live process for channel");
                return false;
            };

            info!(channel_id, pid = ?handle.pid(), "interrupting channel");
            handle.shutdown(self.grace).await;
            true
        }
        .instrument(span)
        .await
    }

    /// Interrupt every registered channel. Returns how many were found.
    pub async fn interrupt_all(&self) -> usize {
        let ids = self.channel_ids().await;
        let mut count = 0;
        for id in ids {
            if self.interrupt(&id).await {
                count += 1;
            }
        }
        count
    }

    /// Read-once check of the interrupted mark for `channel_id`.
    pub async fn take_interrupted(&self, channel_id: &str) -> bool {
        self.interrupted.lock().await.remove(channel_id)
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE)
    }
}
