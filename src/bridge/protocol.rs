//! Tagged line protocol spoken by the agent process on stdout/stderr.
//!
//! Every meaningful line starts with a bracketed tag followed by an optional
//! payload. Classification happens exactly once, here, and produces a typed
//! [`StreamEvent`]; nothing downstream inspects raw prefixes.
//!
//! # Known tags
//!
//! | Tag                      | Payload          | Maps to                               |
//! |--------------------------|------------------|---------------------------------------|
//! | `[MESSAGE]`              | JSON object      | [`StreamEvent::Message`]              |
//! | `[CONTENT]`              | text             | [`StreamEvent::Content`]              |
//! | `[CONTENT_DELTA]`        | text             | [`StreamEvent::ContentDelta`]         |
//! | `[THINKING]`             | text             | [`StreamEvent::Thinking`]             |
//! | `[SESSION_ID]`           | id               | [`StreamEvent::SessionId`]            |
//! | `[SLASH_COMMANDS]`       | JSON array       | [`StreamEvent::SlashCommands`]        |
//! | `[TOOL_RESULT]`          | JSON             | [`StreamEvent::ToolResult`]           |
//! | `[MESSAGE_START]`        | (none)           | [`StreamEvent::MessageStart`]         |
//! | `[MESSAGE_END]`          | (none)           | [`StreamEvent::MessageEnd`]           |
//! | `[SEND_ERROR]`           | JSON or text     | [`StreamEvent::SendError`]            |
//! | `[PERMISSION_REQUEST]`   | `Tool: <name>`   | [`StreamEvent::PermissionNotice`]     |
//! | `[UNCAUGHT_ERROR]`, `[UNHANDLED_REJECTION]`, `[COMMAND_ERROR]` | text | [`StreamEvent::Diagnostic`] |
//! | *(anything else)*        |                  | `Ok(None)`                            |

use serde_json::Value;

use crate::{AppError, Result};

/// Line tags recognised by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    /// Complete structured agent message.
    Message,
    /// Full text block of an assistant message.
    Content,
    /// Incremental assistant text.
    ContentDelta,
    /// Reasoning text.
    Thinking,
    /// Conversation identifier assigned by the agent.
    SessionId,
    /// Available slash commands.
    SlashCommands,
    /// Result of a tool invocation.
    ToolResult,
    /// Start of an agent turn.
    MessageStart,
    /// End of an agent turn.
    MessageEnd,
    /// Explicit failure of the send.
    SendError,
    /// The agent is about to drop a permission request file.
    PermissionRequest,
    /// Uncaught exception in the agent process.
    UncaughtError,
    /// Unhandled promise rejection in the agent process.
    UnhandledRejection,
    /// Command dispatch failure in the agent process.
    CommandError,
}

/// Prefix table. Order does not matter: no prefix is a prefix of another
/// (`[MESSAGE]` and `[MESSAGE_START]` differ at the ninth byte).
const TAGS: &[(&str, Tag)] = &[
    ("[MESSAGE]", Tag::Message),
    ("[CONTENT]", Tag::Content),
    ("[CONTENT_DELTA]", Tag::ContentDelta),
    ("[THINKING]", Tag::Thinking),
    ("[SESSION_ID]", Tag::SessionId),
    ("[SLASH_COMMANDS]", Tag::SlashCommands),
    ("[TOOL_RESULT]", Tag::ToolResult),
    ("[MESSAGE_START]", Tag::MessageStart),
    ("[MESSAGE_END]", Tag::MessageEnd),
    ("[SEND_ERROR]", Tag::SendError),
    ("[PERMISSION_REQUEST]", Tag::PermissionRequest),
    ("[UNCAUGHT_ERROR]", Tag::UncaughtError),
    ("[UNHANDLED_REJECTION]", Tag::UnhandledRejection),
    ("[COMMAND_ERROR]", Tag::CommandError),
];

impl Tag {
    /// Wire prefix of this tag.
    #[must_use]
    pub fn prefix(self) -> &'static str {
        TAGS.iter()
            .find(|(_, tag)| *tag == self)
            .map_or("", |(prefix, _)| prefix)
    }

    /// Whether lines with this tag are recorded as the last known error.
    #[must_use]
    pub fn is_error_marker(self) -> bool {
        matches!(
            self,
            Self::UncaughtError | Self::UnhandledRejection | Self::CommandError
        )
    }
}

/// Split `line` into its tag and trimmed payload.
#[must_use]
pub fn split_tag(line: &str) -> Option<(Tag, &str)> {
    TAGS.iter().find_map(|(prefix, tag)| {
        line.strip_prefix(prefix)
            .map(|payload| (*tag, payload.trim()))
    })
}

/// Typed event decoded from one output line.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Complete structured agent message (`type` = `assistant`, `system`, …).
    Message(Value),
    /// Full text block of an assistant message.
    Content(String),
    /// Incremental assistant text.
    ContentDelta(String),
    /// Reasoning text.
    Thinking(String),
    /// Conversation identifier assigned by the agent.
    SessionId(String),
    /// Available slash commands (JSON array).
    SlashCommands(Value),
    /// Result of a tool invocation.
    ToolResult(Value),
    /// Start of an agent turn.
    MessageStart,
    /// End of an agent turn; callers react to this without waiting for exit.
    MessageEnd,
    /// Explicit failure reported by the agent.
    SendError(String),
    /// The agent is requesting permission to run `tool`.
    PermissionNotice {
        /// Tool name, when the notice carries one.
        tool: Option<String>,
    },
    /// Error marker line, kept verbatim for failure messages.
    Diagnostic {
        /// Which marker matched.
        tag: Tag,
        /// The complete original line.
        line: String,
    },
}

impl StreamEvent {
    /// The `type` field of a [`StreamEvent::Message`] payload.
    #[must_use]
    pub fn message_type(&self) -> Option<&str> {
        match self {
            Self::Message(value) => value.get("type").and_then(Value::as_str),
            _ => None,
        }
    }
}

/// Classify a single output line.
///
/// # Return value
///
/// - `Ok(Some(event))`: the line carries a recognised tag.
/// - `Ok(None)`: the line is untagged diagnostic output.
/// - `Err(AppError::Stream(…))`: a JSON-bearing tag carried malformed JSON.
///
/// # Errors
///
/// Returns [`AppError::Stream`] when the payload of `[MESSAGE]`,
/// `[SLASH_COMMANDS]` or `[TOOL_RESULT]` is not valid JSON, or when a
/// `[MESSAGE]` payload is not a JSON object.
pub fn classify_line(line: &str) -> Result<Option<StreamEvent>> {
    let Some((tag, payload)) = split_tag(line) else {
        return Ok(None);
    };

    let event = match tag {
        Tag::Message => {
            let value = parse_json(tag, payload)?;
            if !value.is_object() {
                return Err(AppError::Stream(
                    "[MESSAGE] payload is not a json object".into(),
                ));
            }
            StreamEvent::Message(value)
        }
        Tag::Content => StreamEvent::Content(payload.to_owned()),
        Tag::ContentDelta => StreamEvent::ContentDelta(payload.to_owned()),
        Tag::Thinking => StreamEvent::Thinking(payload.to_owned()),
        Tag::SessionId => StreamEvent::SessionId(payload.to_owned()),
        Tag::SlashCommands => StreamEvent::SlashCommands(parse_json(tag, payload)?),
        Tag::ToolResult => StreamEvent::ToolResult(parse_json(tag, payload)?),
        Tag::MessageStart => StreamEvent::MessageStart,
        Tag::MessageEnd => StreamEvent::MessageEnd,
        Tag::SendError => StreamEvent::SendError(send_error_message(payload)),
        Tag::PermissionRequest => StreamEvent::PermissionNotice {
            tool: permission_tool(payload),
        },
        Tag::UncaughtError | Tag::UnhandledRejection | Tag::CommandError => {
            StreamEvent::Diagnostic {
                tag,
                line: line.to_owned(),
            }
        }
    };

    Ok(Some(event))
}

fn parse_json(tag: Tag, payload: &str) -> Result<Value> {
    serde_json::from_str(payload)
        .map_err(|e| AppError::Stream(format!("malformed json after {}: {e}", tag.prefix())))
}

/// `[SEND_ERROR]` carries either `{"error": "..."}` or bare text.
fn send_error_message(payload: &str) -> String {
    serde_json::from_str::<Value>(payload)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_owned))
        .unwrap_or_else(|| payload.to_owned())
}

fn permission_tool(payload: &str) -> Option<String> {
    let name = payload
        .strip_prefix("Tool:")
        .unwrap_or(payload)
        .trim();
    (!name.is_empty()).then(|| name.to_owned())
}
