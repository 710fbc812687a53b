//! Permission handshake model.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Operator decision for a permission request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PermissionDecision {
    /// Allow this single invocation.
    Allow,
    /// Allow and remember the decision for identical future requests.
    AllowAlways,
    /// Refuse the invocation.
    Deny,
}

impl PermissionDecision {
    /// Whether the decision lets the tool run.
    #[must_use]
    pub fn is_allow(self) -> bool {
        matches!(self, Self::Allow | Self::AllowAlways)
    }
}

/// Wire format of a `request-<id>.json` file written by the agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequestFile {
    /// Correlation identifier; names the response file.
    pub request_id: String,
    /// Tool the agent wants to run.
    pub tool_name: String,
    /// Tool arguments.
    #[serde(default)]
    pub inputs: Value,
    /// Channel that launched the requesting process, when the agent reports it.
    #[serde(default)]
    pub channel_id: Option<String>,
}

/// Wire format of a `response-<id>.json` file written by the bridge.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseFile {
    /// Whether the tool may run.
    pub allow: bool,
}

/// A permission request observed in the shared directory.
#[derive(Debug, Clone, PartialEq)]
pub struct PermissionRequest {
    /// Correlation identifier.
    pub request_id: String,
    /// Tool the agent wants to run.
    pub tool_name: String,
    /// Tool arguments.
    pub inputs: Value,
    /// Owning channel, if reported.
    pub channel_id: Option<String>,
    /// Location of the request file.
    pub path: PathBuf,
}

impl PermissionRequest {
    /// Build a request from its parsed file and on-disk location.
    #[must_use]
    pub fn from_file(file: RequestFile, path: PathBuf) -> Self {
        Self {
            request_id: file.request_id,
            tool_name: file.tool_name,
            inputs: file.inputs,
            channel_id: file.channel_id,
            path,
        }
    }
}

/// A resolved request, broadcast to interested sessions.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionRecord {
    /// Correlation identifier.
    pub request_id: String,
    /// Tool the decision applies to.
    pub tool_name: String,
    /// Owning channel, if reported.
    pub channel_id: Option<String>,
    /// Final decision.
    pub decision: PermissionDecision,
    /// Whether the decision came from the memory cache without prompting.
    pub remembered: bool,
}
