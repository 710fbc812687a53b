//! File-drop permission handshake.
//!
//! The agent writes `request-<id>.json` into a shared directory and waits
//! for `response-<id>.json`. The pieces:
//!
//! - [`source`]: discovers request files (fixed-interval poll, or `notify`).
//! - [`memory`]: remembers allow-always decisions per (tool, inputs).
//! - [`prompt`]: the collaborator that asks the operator.
//! - [`service`]: resolves each request exactly once and broadcasts the
//!   decision so sessions can interrupt denied turns.

pub mod memory;
pub mod prompt;
pub mod service;
pub mod source;

/// Prefix of request file names.
pub const REQUEST_PREFIX: &str = "request-";
/// Prefix of response file names.
pub const RESPONSE_PREFIX: &str = "response-";
/// Extension shared by request and response files.
pub const FILE_EXTENSION: &str = ".json";

/// Request id embedded in a `request-<id>.json` file name.
#[must_use]
pub fn request_id_from_file_name(name: &str) -> Option<&str> {
    name.strip_prefix(REQUEST_PREFIX)?
        .strip_suffix(FILE_EXTENSION)
        .filter(|id| !id.is_empty())
}

/// File name of the response for `request_id`.
#[must_use]
pub fn response_file_name(request_id: &str) -> String {
    format!("{RESPONSE_PREFIX}{request_id}{FILE_EXTENSION}")
}
