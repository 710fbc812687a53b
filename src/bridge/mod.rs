//! Process bridge to the external agent runtime.
//!
//! [`Bridge`] is the single entry point for everything that spawns a
//! process: the streaming send, the one-shot query, history and
//! slash-command retrieval, and the environment check. It owns the
//! executable resolver and the [`ChannelRegistry`]; both are shared by
//! cloning the bridge.
//!
//! # Send lifecycle
//!
//! 1. Prepare a [`TempWorkspace`] and snapshot leftover markers.
//! 2. Launch the channel script and register the process on its channel.
//! 3. Write the JSON payload to stdin and close it.
//! 4. Stream classified events to the caller until both pipes close.
//! 5. Await exit, settle the [`SendOutcome`], unregister, clean up.
//!
//! [`Bridge::send_message`] never returns an error: every failure becomes a
//! [`SendOutcome::Failed`] so the caller always gets a definite outcome.

pub mod codec;
pub mod executable;
pub mod launcher;
pub mod protocol;
pub mod reader;
pub mod workspace;

use std::ffi::OsString;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::bridge::executable::ExecutableResolver;
use crate::bridge::launcher::{
    build_env, build_payload, launch, resolve_working_dir, usable_dir, write_stdin, EnvContext,
    LaunchSpec, LaunchedProcess,
};
use crate::bridge::protocol::{split_tag, StreamEvent, Tag};
use crate::bridge::reader::{collect_lines, merged_lines, read_stream, ReadSummary};
use crate::bridge::workspace::TempWorkspace;
use crate::config::BridgeConfig;
use crate::models::message::Attachment;
use crate::orchestrator::channel_registry::ChannelRegistry;
use crate::orchestrator::session::HistoryLoader;
use crate::{AppError, Result};

/// Prefix put in front of an exit-code-1 failure with no diagnostics.
pub const ENVIRONMENT_HINT: &str =
    "the agent runtime environment looks misconfigured; check the configured runtime path";

/// Deadline for `<runtime> --version`.
const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

// ── Send request / outcome ───────────────────────────────────────────────────

/// One prompt to deliver on a channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendRequest {
    /// Channel the process is registered under.
    pub channel_id: String,
    /// Prompt text.
    pub message: String,
    /// Conversation to resume; `None` starts a new one.
    pub session_id: Option<String>,
    /// Project directory.
    pub cwd: Option<String>,
    /// Agent permission mode.
    pub permission_mode: Option<String>,
    /// Model identifier.
    pub model: Option<String>,
    /// Files attached to the prompt.
    pub attachments: Vec<Attachment>,
    /// Editor context forwarded verbatim as `openedFiles`.
    pub opened_files: Option<Value>,
}

impl SendRequest {
    /// Request with only the channel and prompt set.
    #[must_use]
    pub fn new(channel_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            message: message.into(),
            ..Self::default()
        }
    }

    /// Channel-script command for this request.
    #[must_use]
    pub fn command(&self) -> &'static str {
        if self.attachments.is_empty() {
            "send"
        } else {
            "sendWithAttachments"
        }
    }
}

/// Terminal outcome of a send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Exit 0 and no `[SEND_ERROR]`.
    Completed,
    /// The channel was interrupted; not a failure regardless of exit code.
    Interrupted,
    /// Spawn failure, explicit send error, or unsuccessful exit.
    Failed(AppError),
}

impl SendOutcome {
    /// Whether the send ended without error.
    #[must_use]
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }
}

/// Outcome plus the facts gathered while reading the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct SendResult {
    /// Terminal outcome.
    pub outcome: SendOutcome,
    /// Process exit code, `None` if the process never started or was
    /// killed by a signal.
    pub exit_code: Option<i32>,
    /// Summary of the output stream.
    pub summary: ReadSummary,
}

impl SendResult {
    fn spawn_failed(err: AppError) -> Self {
        Self {
            outcome: SendOutcome::Failed(err),
            exit_code: None,
            summary: ReadSummary::default(),
        }
    }
}

/// Decide the outcome of a finished send.
///
/// Interruption wins over everything, then an explicit send error, then the
/// exit code. A non-zero exit is enriched with the last diagnostic line, and
/// exit code 1 without any diagnostic gets [`ENVIRONMENT_HINT`].
#[must_use]
pub fn settle_outcome(
    interrupted: bool,
    exit_code: Option<i32>,
    send_error: Option<&str>,
    last_error: Option<&str>,
) -> SendOutcome {
    if interrupted {
        return SendOutcome::Interrupted;
    }
    if let Some(message) = send_error {
        return SendOutcome::Failed(AppError::Send(message.to_owned()));
    }
    if exit_code == Some(0) {
        return SendOutcome::Completed;
    }

    let last_error = last_error.filter(|l| !l.is_empty());
    let mut message = match exit_code {
        Some(code) => format!("process exited with code {code}"),
        None => "process terminated by signal".to_owned(),
    };
    if exit_code == Some(1) && last_error.is_none() {
        message = format!("{ENVIRONMENT_HINT} ({message})");
    }
    if let Some(last) = last_error {
        message.push_str(" | last error: ");
        message.push_str(last);
    }

    SendOutcome::Failed(AppError::ProcessExit(message))
}

// ── Query result ─────────────────────────────────────────────────────────────

/// Result of [`Bridge::query`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryResult {
    /// Whether the query succeeded.
    pub success: bool,
    /// Number of messages the agent produced.
    pub message_count: u64,
    /// Failure reason.
    pub error: Option<String>,
    /// Text of the last `[Assistant]:` line.
    pub final_result: Option<String>,
    /// Complete output.
    pub raw_output: String,
}

/// Parse the output of the query script.
///
/// The JSON block between `[JSON_START]` and `[JSON_END]` is authoritative;
/// without it the exit code decides.
#[must_use]
pub fn parse_query_output(lines: &[String], exit_code: Option<i32>) -> QueryResult {
    let mut json_block = String::new();
    let mut in_json = false;
    let mut final_result = None;

    for line in lines {
        if line.contains("[JSON_START]") {
            in_json = true;
            json_block.clear();
            continue;
        }
        if line.contains("[JSON_END]") {
            in_json = false;
            continue;
        }
        if in_json {
            json_block.push_str(line);
            json_block.push('\n');
        }
        if let Some(idx) = line.find("[Assistant]:") {
            final_result = Some(line[idx + "[Assistant]:".len()..].trim().to_owned());
        }
    }

    let mut result = QueryResult {
        final_result,
        raw_output: lines.join("\n"),
        ..QueryResult::default()
    };

    if json_block.trim().is_empty() {
        result.success = exit_code == Some(0);
        if !result.success {
            result.error = Some(match exit_code {
                Some(code) => format!("process exited with code {code}"),
                None => "process terminated by signal".to_owned(),
            });
        }
        return result;
    }

    match serde_json::from_str::<Value>(json_block.trim()) {
        Ok(value) => {
            result.success = value.get("success").and_then(Value::as_bool).unwrap_or(false);
            if result.success {
                result.message_count = value
                    .get("messageCount")
                    .and_then(Value::as_u64)
                    .unwrap_or_default();
            } else {
                result.error = Some(
                    value
                        .get("error")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error")
                        .to_owned(),
                );
            }
        }
        Err(err) => {
            result.error = Some(format!("malformed query result: {err}"));
        }
    }

    result
}

/// Parse `getSession` output: the JSON object starting at the first `{`.
///
/// # Errors
///
/// - `AppError::Stream` if the object is malformed.
/// - `AppError::Send` if the agent reports `success: false`.
pub fn parse_session_output(output: &str) -> Result<Vec<Value>> {
    let Some(start) = output.find('{') else {
        debug!("getSession produced no json");
        return Ok(Vec::new());
    };

    let value = first_json_value(&output[start..])?;
    if value.get("success").and_then(Value::as_bool) == Some(true) {
        return Ok(value
            .get("messages")
            .and_then(Value::as_array)
            .map(|messages| messages.iter().filter(|m| m.is_object()).cloned().collect())
            .unwrap_or_default());
    }

    let reason = value
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("unknown error");
    Err(AppError::Send(format!("get session failed: {reason}")))
}

/// Parse a `[SLASH_COMMANDS]` payload, or the fallback `{success, commands}`
/// object on the last output line that starts with `{`.
#[must_use]
pub fn parse_slash_commands(tagged: Option<&str>, output: &str) -> Vec<Value> {
    if let Some(payload) = tagged.filter(|p| !p.is_empty()) {
        match serde_json::from_str::<Value>(payload) {
            Ok(Value::Array(items)) => {
                return items.into_iter().filter(Value::is_object).collect();
            }
            Ok(_) => warn!("slash commands payload is not an array"),
            Err(err) => warn!(%err, "failed to parse slash commands payload"),
        }
    }

    output
        .lines()
        .rev()
        .map(str::trim_start)
        .find(|line| line.starts_with('{'))
        .and_then(|line| first_json_value(line).ok())
        .filter(|v| v.get("success").and_then(Value::as_bool) == Some(true))
        .and_then(|v| v.get("commands").and_then(Value::as_array).cloned())
        .map(|items| items.into_iter().filter(Value::is_object).collect())
        .unwrap_or_default()
}

/// First JSON value in `text`, ignoring anything after it.
fn first_json_value(text: &str) -> Result<Value> {
    serde_json::Deserializer::from_str(text)
        .into_iter::<Value>()
        .next()
        .unwrap_or_else(|| Err(<serde_json::Error as serde::de::Error>::custom("empty input")))
        .map_err(AppError::from)
}

// ── Bridge ───────────────────────────────────────────────────────────────────

/// Spawns and tracks agent processes.
#[derive(Debug, Clone)]
pub struct Bridge {
    config: Arc<BridgeConfig>,
    resolver: Arc<ExecutableResolver>,
    registry: ChannelRegistry,
}

impl Bridge {
    /// Create a bridge with its own channel registry.
    #[must_use]
    pub fn new(config: BridgeConfig) -> Self {
        let registry = ChannelRegistry::new(config.interrupt_grace());
        Self::with_registry(config, registry)
    }

    /// Create a bridge sharing an existing registry.
    #[must_use]
    pub fn with_registry(config: BridgeConfig, registry: ChannelRegistry) -> Self {
        Self {
            resolver: Arc::new(ExecutableResolver::new(&config)),
            config: Arc::new(config),
            registry,
        }
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Channel registry shared by every send on this bridge.
    #[must_use]
    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    /// Runtime executable resolver.
    #[must_use]
    pub fn executable(&self) -> &ExecutableResolver {
        &self.resolver
    }

    /// Deliver a prompt and stream the agent's events into `events`.
    ///
    /// Resolves once the process has exited and been accounted for. Events
    /// are forwarded as they arrive, so `[MESSAGE_END]` reaches the caller
    /// before this future resolves.
    pub async fn send_message(
        &self,
        request: SendRequest,
        events: mpsc::Sender<StreamEvent>,
    ) -> SendResult {
        let span = info_span!("send_message", channel_id = %request.channel_id);
        async {
            let workspace = match TempWorkspace::prepare(self.config.temp_dir()) {
                Ok(workspace) => Some(workspace),
                Err(err) => {
                    warn!(%err, "temp workspace unavailable, child keeps inherited temp dir");
                    None
                }
            };

            let result = self.run_send(&request, workspace.as_ref(), &events).await;

            if let Some(workspace) = &workspace {
                workspace.cleanup();
            }

            match &result.outcome {
                SendOutcome::Completed => info!(exit_code = ?result.exit_code, "send completed"),
                SendOutcome::Interrupted => info!(exit_code = ?result.exit_code, "send interrupted"),
                SendOutcome::Failed(err) => warn!(%err, "send failed"),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run_send(
        &self,
        request: &SendRequest,
        workspace: Option<&TempWorkspace>,
        events: &mpsc::Sender<StreamEvent>,
    ) -> SendResult {
        let channel_id = request.channel_id.as_str();
        let args = vec![
            absolute(&self.config.channel_script_path()).into_os_string(),
            OsString::from(&self.config.provider),
            OsString::from(request.command()),
        ];

        let launched = self
            .start(
                channel_id,
                Some(channel_id),
                args,
                request.cwd.as_deref(),
                workspace.map(TempWorkspace::path),
            )
            .await;
        let LaunchedProcess {
            handle,
            stdin,
            stdout,
            stderr,
            exit,
        } = match launched {
            Ok(launched) => launched,
            Err(err) => return SendResult::spawn_failed(err),
        };
        self.registry.register(channel_id, handle.clone()).await;

        let payload = build_payload(request).to_string();
        write_stdin(channel_id, stdin, payload.as_bytes()).await;

        let summary = read_stream(channel_id, stdout, stderr, events, handle.kill_token()).await;

        let exit_code = match exit.await {
            Ok(code) => code,
            Err(err) => {
                warn!(channel_id, %err, "exit monitor task failed");
                None
            }
        };

        let interrupted = self.registry.take_interrupted(channel_id).await;
        self.registry.unregister(channel_id, &handle).await;

        let outcome = settle_outcome(
            interrupted,
            exit_code,
            summary.send_error.as_deref(),
            summary.last_error.as_deref(),
        );

        SendResult {
            outcome,
            exit_code,
            summary,
        }
    }

    /// Run the query script once and parse its result.
    ///
    /// # Errors
    ///
    /// - `AppError::Spawn` if the runtime cannot be started.
    /// - `AppError::Timeout` if the process outlives `timeouts.query_seconds`;
    ///   it is force-killed.
    pub async fn query(&self, prompt: &str) -> Result<QueryResult> {
        let span = info_span!("query");
        async {
            let args = vec![absolute(&self.config.query_script_path()).into_os_string()];
            let LaunchedProcess {
                handle,
                stdin,
                stdout,
                stderr,
                exit,
            } = self.start("query", None, args, None, None).await?;

            let payload = json!({ "prompt": prompt }).to_string();
            write_stdin("query", stdin, payload.as_bytes()).await;

            let collect = async {
                let lines = collect_lines(stdout, stderr).await;
                let code = exit.await.unwrap_or_default();
                (lines, code)
            };

            let limit = self.config.query_timeout();
            let Ok((lines, code)) = tokio::time::timeout(limit, collect).await else {
                handle.kill();
                return Err(AppError::Timeout(format!(
                    "query did not finish within {}s",
                    limit.as_secs()
                )));
            };

            Ok(parse_query_output(&lines, code))
        }
        .instrument(span)
        .await
    }

    /// Fetch the stored messages of a conversation.
    ///
    /// # Errors
    ///
    /// - `AppError::Spawn` if the runtime cannot be started.
    /// - `AppError::Timeout` if the process outlives `timeouts.query_seconds`.
    /// - `AppError::Stream` / `AppError::Send` from [`parse_session_output`].
    pub async fn session_messages(&self, session_id: &str, cwd: Option<&str>) -> Result<Vec<Value>> {
        let span = info_span!("session_messages", session_id);
        async {
            let args = vec![
                absolute(&self.config.channel_script_path()).into_os_string(),
                OsString::from(&self.config.provider),
                OsString::from("getSession"),
                OsString::from(session_id),
                OsString::from(cwd.unwrap_or_default()),
            ];
            let LaunchedProcess {
                handle,
                stdin,
                stdout,
                stderr,
                exit,
            } = self.start("get_session", None, args, None, None).await?;
            drop(stdin);

            let limit = self.config.query_timeout();
            let collect = async {
                let lines = collect_lines(stdout, stderr).await;
                if let Err(err) = exit.await {
                    warn!(%err, "exit monitor task failed");
                }
                lines
            };
            let Ok(lines) = tokio::time::timeout(limit, collect).await else {
                handle.kill();
                return Err(AppError::Timeout(format!(
                    "history load did not finish within {}s",
                    limit.as_secs()
                )));
            };

            let messages = parse_session_output(lines.join("\n").trim())?;
            debug!(count = messages.len(), "session history loaded");
            Ok(messages)
        }
        .instrument(span)
        .await
    }

    /// List the agent's slash commands.
    ///
    /// Returns as soon as a `[SLASH_COMMANDS]` line arrives; the process
    /// does not exit on its own and is always killed afterwards. An empty
    /// list is returned when nothing usable arrives before the deadline.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Spawn` if the runtime cannot be started.
    pub async fn slash_commands(&self, cwd: Option<&str>) -> Result<Vec<Value>> {
        let span = info_span!("slash_commands");
        async {
            let args = vec![
                absolute(&self.config.channel_script_path()).into_os_string(),
                OsString::from(&self.config.provider),
                OsString::from("getSlashCommands"),
            ];
            let LaunchedProcess {
                handle,
                stdin,
                stdout,
                stderr,
                exit,
            } = self.start("slash_commands", None, args, None, None).await?;
            drop(exit);

            let payload = json!({ "cwd": cwd.unwrap_or_default() }).to_string();
            write_stdin("slash_commands", stdin, payload.as_bytes()).await;

            let mut lines = merged_lines(stdout, stderr);
            let mut output = Vec::new();
            let scan = async {
                while let Some(item) = lines.next().await {
                    let Ok(line) = item else { continue };
                    if let Some((Tag::SlashCommands, payload)) = split_tag(&line) {
                        return Some(payload.to_owned());
                    }
                    output.push(line);
                }
                None
            };

            let limit = self.config.slash_commands_timeout();
            let tagged = tokio::time::timeout(limit, scan).await.unwrap_or_else(|_| {
                warn!(timeout_s = limit.as_secs(), "no slash commands before deadline");
                None
            });
            handle.kill();

            let commands = parse_slash_commands(tagged.as_deref(), &output.join("\n"));
            info!(count = commands.len(), "slash commands loaded");
            Ok(commands)
        }
        .instrument(span)
        .await
    }

    /// Whether `<runtime> --version` runs and exits 0.
    pub async fn check_environment(&self) -> bool {
        let runtime = match self.resolver.resolve().await {
            Ok(runtime) => runtime,
            Err(err) => {
                warn!(%err, "environment check: runtime not found");
                return false;
            }
        };

        let output = tokio::process::Command::new(&runtime)
            .arg("--version")
            .kill_on_drop(true)
            .output();
        match tokio::time::timeout(VERSION_CHECK_TIMEOUT, output).await {
            Ok(Ok(output)) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout);
                info!(runtime = %runtime.display(), version = version.trim(), "environment check passed");
                true
            }
            Ok(Ok(output)) => {
                warn!(code = ?output.status.code(), "environment check: runtime exited unsuccessfully");
                false
            }
            Ok(Err(err)) => {
                warn!(%err, "environment check: runtime failed to start");
                false
            }
            Err(_) => {
                warn!("environment check timed out");
                false
            }
        }
    }

    /// Interrupt the process on `channel_id`, if any.
    pub async fn interrupt_channel(&self, channel_id: &str) -> bool {
        self.registry.interrupt(channel_id).await
    }

    /// Number of processes currently registered.
    pub async fn active_process_count(&self) -> usize {
        self.registry.len().await
    }

    /// Interrupt every registered process. Returns how many were found.
    pub async fn shutdown(&self) -> usize {
        let count = self.registry.interrupt_all().await;
        info!(count, "bridge shut down");
        count
    }

    /// Resolve the runtime and launch it with `args`.
    ///
    /// `channel_id` is exported to the child so permission requests can name
    /// their owner; one-shot operations pass `None`.
    async fn start(
        &self,
        label: &str,
        channel_id: Option<&str>,
        args: Vec<OsString>,
        cwd: Option<&str>,
        temp_dir: Option<&Path>,
    ) -> Result<LaunchedProcess> {
        let runtime = self.resolver.resolve().await?;
        let project_dir = usable_dir(cwd);
        let permission_dir = self.config.permission_dir();

        let env = build_env(&EnvContext {
            path: self.resolver.child_path(&runtime)?,
            temp_dir,
            permission_dir: &permission_dir,
            project_dir: project_dir.as_deref(),
            channel_id,
            use_stdin: true,
        });

        let spec = LaunchSpec {
            working_dir: resolve_working_dir(cwd, &absolute(&self.config.bridge_dir)),
            program: runtime,
            args,
            env,
        };
        launch(label, &spec)
    }
}

impl HistoryLoader for Bridge {
    fn load_history<'a>(
        &'a self,
        session_id: &'a str,
        cwd: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Value>>> + Send + 'a>> {
        Box::pin(self.session_messages(session_id, cwd))
    }
}

/// `path` made absolute against the current directory, when possible.
fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
