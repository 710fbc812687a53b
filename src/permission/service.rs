//! Permission request resolution.
//!
//! For each discovered request file the service:
//!
//! 1. waits the settle delay so the writer can finish;
//! 2. resolves from [`DecisionMemory`] or asks the [`PermissionPrompt`],
//!    denying when the prompt does not answer within the timeout;
//! 3. writes `response-<id>.json` atomically, *then* deletes the request;
//! 4. broadcasts a [`DecisionRecord`].
//!
//! Each request id is resolved at most once while it is in flight.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::NamedTempFile;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::BridgeConfig;
use crate::models::permission::{
    DecisionRecord, PermissionDecision, PermissionRequest, RequestFile, ResponseFile,
};
use crate::permission::memory::DecisionMemory;
use crate::permission::prompt::PermissionPrompt;
use crate::permission::source::RequestSource;
use crate::permission::{request_id_from_file_name, response_file_name};
use crate::{AppError, Result};

/// Capacity of the decision broadcast channel.
const DECISION_BUFFER: usize = 64;

struct ServiceInner {
    dir: PathBuf,
    memory: DecisionMemory,
    prompt: Arc<dyn PermissionPrompt>,
    timeout: Duration,
    settle: Duration,
    decisions: broadcast::Sender<DecisionRecord>,
    in_flight: Mutex<HashSet<String>>,
}

/// Resolves permission requests dropped by agent processes.
#[derive(Clone)]
pub struct PermissionService {
    inner: Arc<ServiceInner>,
}

impl std::fmt::Debug for PermissionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionService")
            .field("dir", &self.inner.dir)
            .field("timeout", &self.inner.timeout)
            .finish_non_exhaustive()
    }
}

impl PermissionService {
    /// Service for the configured permission directory with a fresh memory.
    #[must_use]
    pub fn new(config: &BridgeConfig, prompt: Arc<dyn PermissionPrompt>) -> Self {
        Self::with_memory(config, prompt, DecisionMemory::new())
    }

    /// Service sharing an existing decision memory.
    #[must_use]
    pub fn with_memory(
        config: &BridgeConfig,
        prompt: Arc<dyn PermissionPrompt>,
        memory: DecisionMemory,
    ) -> Self {
        let (decisions, _) = broadcast::channel(DECISION_BUFFER);
        Self {
            inner: Arc::new(ServiceInner {
                dir: config.permission_dir(),
                memory,
                prompt,
                timeout: config.permission_timeout(),
                settle: config.settle_delay(),
                decisions,
                in_flight: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Directory watched for requests.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Decision memory.
    #[must_use]
    pub fn memory(&self) -> &DecisionMemory {
        &self.inner.memory
    }

    /// Subscribe to resolved decisions.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DecisionRecord> {
        self.inner.decisions.subscribe()
    }

    /// Resolve the request at `path`.
    ///
    /// Returns `Ok(None)` if the request is already being handled or the file
    /// disappeared before it could be read.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Permission` if the file name is not a request file
    /// or the response cannot be written.
    pub async fn handle_request(&self, path: &Path) -> Result<Option<DecisionRecord>> {
        let request_id = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(request_id_from_file_name)
            .ok_or_else(|| {
                AppError::Permission(format!("not a request file: {}", path.display()))
            })?
            .to_owned();

        if !self.inner.in_flight.lock().await.insert(request_id.clone()) {
            return Ok(None);
        }

        let span = info_span!("permission_request", request_id = request_id.as_str());
        let result = self.resolve(&request_id, path).instrument(span).await;

        self.inner.in_flight.lock().await.remove(&request_id);
        result
    }

    async fn resolve(&self, request_id: &str, path: &Path) -> Result<Option<DecisionRecord>> {
        tokio::time::sleep(self.inner.settle).await;

        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("request file already gone");
                return Ok(None);
            }
            Err(err) => {
                return Err(AppError::Permission(format!(
                    "failed to read {}: {err}",
                    path.display()
                )));
            }
        };

        let record = match serde_json::from_str::<RequestFile>(&raw) {
            Ok(file) => {
                if file.request_id != request_id {
                    warn!(
                        file_request_id = file.request_id.as_str(),
                        "request id differs from file name, answering by file name"
                    );
                }
                let request = PermissionRequest::from_file(file, path.to_path_buf());
                self.decide(request_id, &request).await
            }
            Err(err) => {
                warn!(%err, "malformed permission request, denying");
                DecisionRecord {
                    request_id: request_id.to_owned(),
                    tool_name: String::new(),
                    channel_id: None,
                    decision: PermissionDecision::Deny,
                    remembered: false,
                }
            }
        };

        let response = write_response(&self.inner.dir, request_id, record.decision.is_allow()).await?;
        debug!(response = %response.display(), "response written");

        if let Err(err) = tokio::fs::remove_file(path).await {
            warn!(%err, "failed to delete request file");
        }

        info!(
            tool = record.tool_name.as_str(),
            decision = ?record.decision,
            remembered = record.remembered,
            "permission request resolved"
        );
        if self.inner.decisions.send(record.clone()).is_err() {
            debug!("no decision subscribers");
        }
        Ok(Some(record))
    }

    async fn decide(&self, request_id: &str, request: &PermissionRequest) -> DecisionRecord {
        let memory = &self.inner.memory;
        let (decision, remembered) =
            if let Some(decision) = memory.lookup(&request.tool_name, &request.inputs).await {
                (decision, true)
            } else {
                let decision = match tokio::time::timeout(
                    self.inner.timeout,
                    self.inner.prompt.decide(request),
                )
                .await
                {
                    Ok(decision) => decision,
                    Err(_) => {
                        warn!(
                            tool = request.tool_name.as_str(),
                            timeout_s = self.inner.timeout.as_secs(),
                            "permission prompt timed out, denying"
                        );
                        PermissionDecision::Deny
                    }
                };
                memory
                    .remember(&request.tool_name, &request.inputs, decision)
                    .await;
                (decision, false)
            };

        DecisionRecord {
            request_id: request_id.to_owned(),
            tool_name: request.tool_name.clone(),
            channel_id: request.channel_id.clone(),
            decision,
            remembered,
        }
    }

    /// Resolve requests from `source` until `cancel` fires.
    ///
    /// Each request is handled on its own task so a slow prompt does not
    /// hold up the others.
    pub async fn run(&self, mut source: Box<dyn RequestSource>, cancel: CancellationToken) {
        if let Err(err) = tokio::fs::create_dir_all(&self.inner.dir).await {
            warn!(dir = %self.inner.dir.display(), %err, "failed to create permission directory");
        }
        info!(dir = %self.inner.dir.display(), "permission service started");

        loop {
            let batch = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                batch = source.next_batch() => batch,
            };

            for path in batch {
                let service = self.clone();
                tokio::spawn(async move {
                    if let Err(err) = service.handle_request(&path).await {
                        warn!(path = %path.display(), %err, "permission request failed");
                    }
                });
            }
        }

        info!("permission service stopped");
    }

    /// Run the service on a background task.
    #[must_use]
    pub fn spawn(&self, source: Box<dyn RequestSource>, cancel: CancellationToken) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move { service.run(source, cancel).await; })
    }
}

/// Atomically write `response-<id>.json` into `dir`.
///
/// # Errors
///
/// Returns `AppError::Permission` on any I/O failure.
pub async fn write_response(dir: &Path, request_id: &str, allow: bool) -> Result<PathBuf> {
    let target = dir.join(response_file_name(request_id));
    let dir = dir.to_path_buf();
    let body = serde_json::to_vec(&ResponseFile { allow })?;

    tokio::task::spawn_blocking(move || {
        let mut tmp = NamedTempFile::new_in(&dir)
            .map_err(|err| AppError::Permission(format!("failed to create temporary file: {err}")))?;
        tmp.write_all(&body)
            .map_err(|err| AppError::Permission(format!("failed to write response: {err}")))?;
        tmp.persist(&target).map_err(|err| {
            AppError::Permission(format!(
                "failed to persist response to {}: {err}",
                target.display()
            ))
        })?;
        Ok(target)
    })
    .await
    .map_err(|err| AppError::Permission(format!("response writer task failed: {err}")))?
}
