//! Session engine: one conversation's history and transient state.
//!
//! A [`Session`] turns prompts into bridge sends, folds the streamed
//! [`StreamEvent`]s into its message list, and reports every change on a
//! single [`SessionEvent`] channel handed out by [`Session::new`].
//!
//! # State
//!
//! `busy` is set for the duration of a send (cleared early on
//! `[MESSAGE_END]`), `loading` while history loads, and `error` is an
//! overlay that coexists with either.
//!
//! # Ordering
//!
//! Sends on one session are serialised by a turn lock: a second prompt is
//! appended to the history immediately but its process only starts once the
//! previous turn has finished. Within a turn, only the task consuming that
//! turn's event stream mutates the assistant message.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Mutex, Notify};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::bridge::protocol::StreamEvent;
use crate::bridge::{Bridge, SendOutcome, SendRequest};
use crate::config::BridgeConfig;
use crate::models::message::{Attachment, Message, MessageKind};
use crate::models::permission::DecisionRecord;
use crate::orchestrator::merge::{extract_message_text, has_content, merge_assistant_message};
use crate::Result;

/// Characters of the first prompt kept as the session summary.
pub const SUMMARY_CHARS: usize = 45;

/// Capacity of the session event channel and of each turn's stream channel.
pub const EVENT_BUFFER: usize = 256;

// ── Collaborators ────────────────────────────────────────────────────────────

/// Source of a conversation's stored messages.
///
/// [`Bridge`] implements this by running the agent's `getSession` command;
/// tests substitute an in-memory loader.
pub trait HistoryLoader: Send + Sync {
    /// Load raw stored messages for `session_id`.
    ///
    /// # Errors
    ///
    /// Implementations return an error if the history cannot be retrieved.
    fn load_history<'a>(
        &'a self,
        session_id: &'a str,
        cwd: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Value>>> + Send + 'a>>;
}

// ── Events ───────────────────────────────────────────────────────────────────

/// Snapshot of a session's transient state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    /// A send is in flight.
    pub busy: bool,
    /// History is being loaded.
    pub loading: bool,
    /// Last error, if any.
    pub error: Option<String>,
}

/// Change notification emitted by a [`Session`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Immutable snapshot of the full message list.
    MessagesUpdated(Vec<Message>),
    /// Busy/loading/error changed.
    StateChanged(SessionState),
    /// The agent assigned or confirmed the conversation id.
    SessionIdReceived(String),
    /// The agent is waiting on a permission decision.
    PermissionRequested {
        /// Tool awaiting approval, when announced.
        tool_name: Option<String>,
    },
    /// Reasoning text.
    Thinking(String),
    /// Tool invocation result.
    ToolResult(Value),
    /// Available slash commands.
    SlashCommands(Value),
    /// A send finished.
    Completed(SendOutcome),
}

// ── Session ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct SessionInner {
    session_id: Option<String>,
    channel_id: Option<String>,
    cwd: Option<String>,
    permission_mode: String,
    model: Option<String>,
    messages: Vec<Message>,
    summary: Option<String>,
    busy: bool,
    loading: bool,
    error: Option<String>,
    last_modified: DateTime<Utc>,
    /// Bumped whenever `messages` is replaced wholesale.
    generation: u64,
}

impl SessionInner {
    fn state(&self) -> SessionState {
        SessionState {
            busy: self.busy,
            loading: self.loading,
            error: self.error.clone(),
        }
    }
}

/// Per-turn streaming state, owned by the consuming task.
#[derive(Debug, Default)]
struct Turn {
    /// Index of this turn's assistant message, valid for `generation` only.
    assistant: Option<usize>,
    /// Message-list generation `assistant` was taken from.
    generation: u64,
    /// Merged assistant payload so far.
    raw: Option<Value>,
    /// Accumulated display text of the assistant message.
    text: String,
    /// Whether an error message was already appended for this turn.
    error_reported: bool,
}

/// One conversation.
///
/// Cloning yields another handle to the same conversation.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Mutex<SessionInner>>,
    turn_lock: Arc<Mutex<()>>,
    bridge: Bridge,
    history: Arc<dyn HistoryLoader>,
    events: mpsc::Sender<SessionEvent>,
    permission_wake: Option<Arc<Notify>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("bridge", &self.bridge)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session and the receiver for its events.
    ///
    /// The receiver must be drained: events are delivered with
    /// backpressure, so a full channel stalls the session.
    #[must_use]
    pub fn new(
        bridge: Bridge,
        history: Arc<dyn HistoryLoader>,
        config: &BridgeConfig,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (events, rx) = mpsc::channel(EVENT_BUFFER);
        let inner = SessionInner {
            session_id: None,
            channel_id: None,
            cwd: None,
            permission_mode: config.default_permission_mode.clone(),
            model: config.default_model.clone(),
            messages: Vec::new(),
            summary: None,
            busy: false,
            loading: false,
            error: None,
            last_modified: Utc::now(),
            generation: 0,
        };

        let session = Self {
            inner: Arc::new(Mutex::new(inner)),
            turn_lock: Arc::new(Mutex::new(())),
            bridge,
            history,
            events,
            permission_wake: None,
        };
        (session, rx)
    }

    /// Wake `notify` whenever the agent announces a permission request.
    #[must_use]
    pub fn with_permission_wake(mut self, notify: Arc<Notify>) -> Self {
        self.permission_wake = Some(notify);
        self
    }

    // ── Accessors ────────────────────────────────────────────────────────

    /// Conversation id, once known.
    pub async fn session_id(&self) -> Option<String> {
        self.inner.lock().await.session_id.clone()
    }

    /// Channel id, once launched.
    pub async fn channel_id(&self) -> Option<String> {
        self.inner.lock().await.channel_id.clone()
    }

    /// Working directory.
    pub async fn cwd(&self) -> Option<String> {
        self.inner.lock().await.cwd.clone()
    }

    /// Permission mode sent with each prompt.
    pub async fn permission_mode(&self) -> String {
        self.inner.lock().await.permission_mode.clone()
    }

    /// Model sent with each prompt.
    pub async fn model(&self) -> Option<String> {
        self.inner.lock().await.model.clone()
    }

    /// Snapshot of the message list.
    pub async fn messages(&self) -> Vec<Message> {
        self.inner.lock().await.messages.clone()
    }

    /// First prompt, truncated.
    pub async fn summary(&self) -> Option<String> {
        self.inner.lock().await.summary.clone()
    }

    /// Time of the last send or completion.
    pub async fn last_modified(&self) -> DateTime<Utc> {
        self.inner.lock().await.last_modified
    }

    /// Current busy/loading/error state.
    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state()
    }

    // ── Setters ──────────────────────────────────────────────────────────

    /// Resume an existing conversation in `cwd`.
    pub async fn set_session_info(&self, session_id: Option<String>, cwd: Option<String>) {
        let mut inner = self.inner.lock().await;
        inner.session_id = session_id;
        inner.cwd = cwd;
    }

    /// Change the working directory.
    pub async fn set_cwd(&self, cwd: Option<String>) {
        info!(cwd = ?cwd, "session working directory updated");
        self.inner.lock().await.cwd = cwd;
    }

    /// Change the permission mode for subsequent prompts.
    pub async fn set_permission_mode(&self, mode: impl Into<String>) {
        self.inner.lock().await.permission_mode = mode.into();
    }

    /// Change the model for subsequent prompts.
    pub async fn set_model(&self, model: Option<String>) {
        self.inner.lock().await.model = model;
    }

    // ── Operations ───────────────────────────────────────────────────────

    /// Ensure the session has a channel and return its id.
    ///
    /// A fresh channel id is created lazily; launching clears any previous
    /// error. No process is started until the first send.
    pub async fn launch(&self) -> String {
        let (channel_id, created, state) = {
            let mut inner = self.inner.lock().await;
            if let Some(id) = inner.channel_id.clone() {
                (id, false, None)
            } else {
                let id = Uuid::new_v4().to_string();
                inner.channel_id = Some(id.clone());
                let cleared = inner.error.take().is_some();
                (id, true, cleared.then(|| inner.state()))
            }
        };

        if created {
            debug!(channel_id = channel_id.as_str(), "channel created");
        }
        if let Some(state) = state {
            self.emit(SessionEvent::StateChanged(state)).await;
        }
        channel_id
    }

    /// Send `prompt` with optional attachments.
    ///
    /// Resolves once the turn has completed; the outcome is also emitted as
    /// [`SessionEvent::Completed`]. Failures are recorded on the session and
    /// never propagated.
    pub async fn send(&self, prompt: &str, attachments: Vec<Attachment>) -> SendOutcome {
        self.send_with_context(prompt, attachments, None).await
    }

    /// Like [`Session::send`], forwarding editor context as `openedFiles`.
    pub async fn send_with_context(
        &self,
        prompt: &str,
        attachments: Vec<Attachment>,
        opened_files: Option<Value>,
    ) -> SendOutcome {
        let (messages, state) = {
            let mut inner = self.inner.lock().await;
            inner.messages.push(Message::user(prompt));
            if inner.summary.is_none() {
                inner.summary = Some(summarize(prompt));
            }
            inner.last_modified = Utc::now();
            inner.busy = true;
            (inner.messages.clone(), inner.state())
        };
        self.emit(SessionEvent::MessagesUpdated(messages)).await;
        self.emit(SessionEvent::StateChanged(state)).await;

        let _turn = self.turn_lock.lock().await;
        self.set_busy(true).await;

        let request = self.build_request(prompt, attachments, opened_files).await;
        let span = info_span!("session_send", channel_id = request.channel_id.as_str());

        async {
            let (tx, rx) = mpsc::channel(EVENT_BUFFER);
            let (result, turn) = tokio::join!(self.bridge.send_message(request, tx), self.consume(rx));
            self.finish(&result.outcome, &turn).await;
            result.outcome
        }
        .instrument(span)
        .await
    }

    /// Interrupt the in-flight send, if any.
    ///
    /// Clears `busy` without recording an error.
    pub async fn interrupt(&self) {
        let Some(channel_id) = self.channel_id().await else {
            return;
        };

        self.bridge.interrupt_channel(&channel_id).await;
        self.set_busy(false).await;
    }

    /// Interrupt, drop the channel, and create a fresh one.
    pub async fn restart(&self) -> String {
        self.interrupt().await;
        self.inner.lock().await.channel_id = None;
        self.set_busy(false).await;
        self.launch().await
    }

    /// Replace the message list with the stored history.
    ///
    /// Without a session id this is a no-op returning `Ok(0)`. `loading` is
    /// cleared on every path; a failure is also recorded as the session
    /// error.
    ///
    /// # Errors
    ///
    /// Returns the loader's error.
    pub async fn load_from_server(&self) -> Result<usize> {
        let (session_id, cwd, state) = {
            let mut inner = self.inner.lock().await;
            let Some(session_id) = inner.session_id.clone() else {
                return Ok(0);
            };
            inner.loading = true;
            (session_id, inner.cwd.clone(), inner.state())
        };
        self.emit(SessionEvent::StateChanged(state)).await;

        let span = info_span!("load_from_server", session_id = session_id.as_str());
        let loaded = self
            .history
            .load_history(&session_id, cwd.as_deref())
            .instrument(span)
            .await;

        let (messages, state, outcome) = {
            let mut inner = self.inner.lock().await;
            inner.loading = false;
            let outcome = match loaded {
                Ok(raw) => {
                    inner.messages = raw.iter().filter_map(parse_history_message).collect();
                    inner.generation = inner.generation.wrapping_add(1);
                    info!(
                        session_id = session_id.as_str(),
                        received = raw.len(),
                        kept = inner.messages.len(),
                        "session history loaded"
                    );
                    Ok(inner.messages.len())
                }
                Err(err) => {
                    warn!(session_id = session_id.as_str(), %err, "failed to load session history");
                    inner.error = Some(err.message().to_owned());
                    Err(err)
                }
            };
            let messages = outcome.is_ok().then(|| inner.messages.clone());
            (messages, inner.state(), outcome)
        };

        if let Some(messages) = messages {
            self.emit(SessionEvent::MessagesUpdated(messages)).await;
        }
        self.emit(SessionEvent::StateChanged(state)).await;
        outcome
    }

    /// Interrupt this session whenever a permission request it owns is denied.
    ///
    /// A decision without a channel id applies to every watching session.
    /// Runs until the decision stream closes.
    pub async fn watch_permission_denials(&self, mut decisions: broadcast::Receiver<DecisionRecord>) {
        loop {
            let record = match decisions.recv().await {
                Ok(record) => record,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "permission decision stream lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            if record.decision.is_allow() {
                continue;
            }

            let own_channel = self.channel_id().await;
            let applies = match (&record.channel_id, &own_channel) {
                (None, _) => true,
                (Some(target), Some(own)) => target == own,
                (Some(_), None) => false,
            };
            if applies {
                info!(
                    request_id = record.request_id.as_str(),
                    tool = record.tool_name.as_str(),
                    "permission denied, interrupting turn"
                );
                self.interrupt().await;
            }
        }
    }

    // ── Internals ────────────────────────────────────────────────────────

    async fn build_request(
        &self,
        prompt: &str,
        attachments: Vec<Attachment>,
        opened_files: Option<Value>,
    ) -> SendRequest {
        let channel_id = self.launch().await;
        let mut inner = self.inner.lock().await;
        if inner.session_id.as_deref().is_some_and(looks_like_path) {
            warn!(session_id = ?inner.session_id, "session id looks like a path, discarding");
            inner.session_id = None;
        }

        SendRequest {
            channel_id,
            message: prompt.to_owned(),
            session_id: inner.session_id.clone(),
            cwd: inner.cwd.clone(),
            permission_mode: Some(inner.permission_mode.clone()),
            model: inner.model.clone(),
            attachments,
            opened_files,
        }
    }

    async fn consume(&self, mut rx: mpsc::Receiver<StreamEvent>) -> Turn {
        let mut turn = Turn::default();
        while let Some(event) = rx.recv().await {
            self.apply(&mut turn, event).await;
        }
        turn
    }

    async fn apply(&self, turn: &mut Turn, event: StreamEvent) {
        match event {
            StreamEvent::Message(payload) => self.apply_message(turn, &payload).await,
            StreamEvent::Content(text) | StreamEvent::ContentDelta(text) => {
                turn.text.push_str(&text);
                let messages = {
                    let mut inner = self.inner.lock().await;
                    let idx = assistant_slot(&mut inner, turn);
                    inner.messages[idx].content.clone_from(&turn.text);
                    inner.messages.clone()
                };
                self.emit(SessionEvent::MessagesUpdated(messages)).await;
            }
            StreamEvent::Thinking(text) => self.emit(SessionEvent::Thinking(text)).await,
            StreamEvent::SessionId(id) => {
                if id.is_empty() || looks_like_path(&id) {
                    warn!(session_id = id.as_str(), "ignoring invalid session id from agent");
                    return;
                }
                self.inner.lock().await.session_id = Some(id.clone());
                info!(session_id = id.as_str(), "session id captured");
                self.emit(SessionEvent::SessionIdReceived(id)).await;
            }
            StreamEvent::SlashCommands(commands) => {
                self.emit(SessionEvent::SlashCommands(commands)).await;
            }
            StreamEvent::ToolResult(result) => self.emit(SessionEvent::ToolResult(result)).await,
            StreamEvent::MessageStart => debug!("agent turn started"),
            StreamEvent::MessageEnd => self.set_busy(false).await,
            StreamEvent::SendError(message) => {
                let (messages, state) = {
                    let mut inner = self.inner.lock().await;
                    inner.error = Some(message.clone());
                    inner.messages.push(Message::error(message));
                    (inner.messages.clone(), inner.state())
                };
                turn.error_reported = true;
                self.emit(SessionEvent::MessagesUpdated(messages)).await;
                self.emit(SessionEvent::StateChanged(state)).await;
            }
            StreamEvent::PermissionNotice { tool } => {
                if let Some(wake) = &self.permission_wake {
                    wake.notify_one();
                }
                self.emit(SessionEvent::PermissionRequested { tool_name: tool }).await;
            }
            StreamEvent::Diagnostic { .. } => {}
        }
    }

    async fn apply_message(&self, turn: &mut Turn, payload: &Value) {
        let kind = payload.get("type").and_then(Value::as_str).unwrap_or("unknown");
        if kind != "assistant" {
            debug!(kind, "agent message");
            return;
        }

        let merged = match merge_assistant_message(turn.raw.as_ref(), payload) {
            Ok(merged) => merged,
            Err(err) => {
                warn!(%err, "dropping unmergeable assistant chunk");
                return;
            }
        };
        turn.raw = Some(merged.clone());
        if !has_content(&merged) {
            debug!("assistant chunk without content");
            return;
        }

        let messages = {
            let mut inner = self.inner.lock().await;
            turn.text = extract_message_text(&merged);
            let idx = assistant_slot(&mut inner, turn);
            let message = &mut inner.messages[idx];
            message.content.clone_from(&turn.text);
            message.raw = Some(merged);
            inner.messages.clone()
        };
        self.emit(SessionEvent::MessagesUpdated(messages)).await;
    }

    async fn finish(&self, outcome: &SendOutcome, turn: &Turn) {
        let (messages, state) = {
            let mut inner = self.inner.lock().await;
            inner.busy = false;
            inner.last_modified = Utc::now();
            let mut appended = false;
            if let SendOutcome::Failed(err) = outcome {
                inner.error = Some(err.message().to_owned());
                if !turn.error_reported {
                    inner.messages.push(Message::error(err.message()));
                    appended = true;
                }
            }
            (appended.then(|| inner.messages.clone()), inner.state())
        };

        if let Some(messages) = messages {
            self.emit(SessionEvent::MessagesUpdated(messages)).await;
        }
        self.emit(SessionEvent::StateChanged(state)).await;
        self.emit(SessionEvent::Completed(outcome.clone())).await;
    }

    async fn set_busy(&self, busy: bool) {
        let state = {
            let mut inner = self.inner.lock().await;
            if inner.busy == busy {
                return;
            }
            inner.busy = busy;
            inner.state()
        };
        self.emit(SessionEvent::StateChanged(state)).await;
    }

    async fn emit(&self, event: SessionEvent) {
        if self.events.send(event).await.is_err() {
            debug!("session event receiver dropped");
        }
    }
}

/// Index of the turn's assistant message, appending an empty one if needed.
///
/// A replaced message list invalidates the remembered index, so the turn
/// continues in a new message instead of writing into loaded history.
fn assistant_slot(inner: &mut SessionInner, turn: &mut Turn) -> usize {
    let current = turn.assistant.filter(|idx| {
        turn.generation == inner.generation
            && inner
                .messages
                .get(*idx)
                .is_some_and(|m| m.kind == MessageKind::Assistant)
    });
    if let Some(idx) = current {
        return idx;
    }
    inner
        .messages
        .push(Message::new(MessageKind::Assistant, String::new()));
    let idx = inner.messages.len() - 1;
    turn.assistant = Some(idx);
    turn.generation = inner.generation;
    idx
}

/// First [`SUMMARY_CHARS`] characters of `prompt`, with `...` if truncated.
#[must_use]
pub fn summarize(prompt: &str) -> String {
    if prompt.chars().count() > SUMMARY_CHARS {
        let head: String = prompt.chars().take(SUMMARY_CHARS).collect();
        format!("{head}...")
    } else {
        prompt.to_owned()
    }
}

/// Whether `session_id` looks like a file path rather than an id.
#[must_use]
pub fn looks_like_path(session_id: &str) -> bool {
    session_id.contains('/') || session_id.contains('\\')
}

/// Convert one stored message into a timeline entry.
///
/// Only `user` and `assistant` entries are kept.
#[must_use]
pub fn parse_history_message(raw: &Value) -> Option<Message> {
    let kind = match raw.get("type").and_then(Value::as_str)? {
        "user" => MessageKind::User,
        "assistant" => MessageKind::Assistant,
        _ => return None,
    };
    Some(Message::with_raw(kind, extract_message_text(raw), raw.clone()))
}
