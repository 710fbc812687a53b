//! Conversation message model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of a conversation message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Prompt typed by the user.
    User,
    /// Agent reply; mutable in place while the turn streams.
    Assistant,
    /// Informational message produced by the bridge.
    System,
    /// Failure surfaced to the user.
    Error,
}

/// A single entry in a session timeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Message {
    /// Message kind.
    pub kind: MessageKind,
    /// Rendered text content.
    pub content: String,
    /// Creation timestamp.
    pub timestamp: DateTime<Utc>,
    /// Last fully merged structured payload, for assistant and history messages.
    pub raw: Option<Value>,
}

impl Message {
    /// Construct a message without a structured payload.
    #[must_use]
    pub fn new(kind: MessageKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            timestamp: Utc::now(),
            raw: None,
        }
    }

    /// Construct a message carrying its structured payload.
    #[must_use]
    pub fn with_raw(kind: MessageKind, content: impl Into<String>, raw: Value) -> Self {
        Self {
            raw: Some(raw),
            ..Self::new(kind, content)
        }
    }

    /// Convenience constructor for a user prompt.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageKind::User, content)
    }

    /// Convenience constructor for an error entry.
    #[must_use]
    pub fn error(content: impl Into<String>) -> Self {
        Self::new(MessageKind::Error, content)
    }
}

/// A file attached to a prompt, forwarded to the agent as base64.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// Original file name.
    pub file_name: String,
    /// MIME type, e.g. `image/png`.
    pub media_type: String,
    /// Base64-encoded file content.
    pub data: String,
}

impl Attachment {
    /// Construct an attachment from already-encoded data.
    #[must_use]
    pub fn new(
        file_name: impl Into<String>,
        media_type: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            media_type: media_type.into(),
            data: data.into(),
        }
    }
}
