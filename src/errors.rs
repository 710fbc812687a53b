//! Error types shared across the bridge.

use std::fmt::{Display, Formatter};

/// Shared bridge result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Bridge error enumeration covering all domain failure modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Executable or working-directory resolution failed, or the OS refused
    /// to start the process.
    Spawn(String),
    /// A tagged line carried a payload that could not be parsed.
    Stream(String),
    /// The agent process reported an explicit failure via `[SEND_ERROR]`.
    Send(String),
    /// The agent process exited unsuccessfully without an explicit send error.
    ProcessExit(String),
    /// Permission handshake failure (unreadable request, unwritable response).
    Permission(String),
    /// A bounded wait elapsed.
    Timeout(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::Stream(msg) => write!(f, "stream: {msg}"),
            Self::Send(msg) => write!(f, "send: {msg}"),
            Self::ProcessExit(msg) => write!(f, "process exit: {msg}"),
            Self::Permission(msg) => write!(f, "permission: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl AppError {
    /// The bare message without the kind prefix.
    ///
    /// Used when an error is surfaced to the host as message text, where the
    /// `kind:` prefix would only add noise.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Config(msg)
            | Self::Spawn(msg)
            | Self::Stream(msg)
            | Self::Send(msg)
            | Self::ProcessExit(msg)
            | Self::Permission(msg)
            | Self::Timeout(msg)
            | Self::NotFound(msg)
            | Self::Io(msg) => msg,
        }
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Stream(format!("malformed json: {err}"))
    }
}
