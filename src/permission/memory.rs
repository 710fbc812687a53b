//! Decision memory keyed by a (tool, inputs) fingerprint.
//!
//! Only [`PermissionDecision::AllowAlways`] is remembered. One-time allows
//! and denials always reach the prompt again.

use std::collections::HashMap;
use std::fmt::Write;
use std::sync::Arc;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::debug;

use crate::models::permission::PermissionDecision;

/// SHA-256 hex digest of `tool_name` and the canonical JSON of `inputs`.
///
/// `serde_json` keeps object keys sorted, so structurally equal inputs
/// produce the same fingerprint regardless of key order on the wire.
#[must_use]
pub fn fingerprint(tool_name: &str, inputs: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tool_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(inputs.to_string().as_bytes());

    let digest = hasher.finalize();
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

/// Shared, cloneable decision cache.
#[derive(Debug, Clone, Default)]
pub struct DecisionMemory {
    entries: Arc<RwLock<HashMap<String, PermissionDecision>>>,
}

impl DecisionMemory {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remembered decision for this tool invocation, if any.
    pub async fn lookup(&self, tool_name: &str, inputs: &Value) -> Option<PermissionDecision> {
        let key = fingerprint(tool_name, inputs);
        self.entries.read().await.get(&key).copied()
    }

    /// Record `decision`. Returns whether it was cached.
    pub async fn remember(&self, tool_name: &str, inputs: &Value, decision: PermissionDecision) -> bool {
        if decision != PermissionDecision::AllowAlways {
            return false;
        }
        let key = fingerprint(tool_name, inputs);
        debug!(tool = tool_name, fingerprint = key.as_str(), "remembering decision");
        self.entries.write().await.insert(key, decision);
        true
    }

    /// Forget every remembered decision.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// Number of remembered decisions.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether nothing is remembered.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
