//! Per-invocation scratch directory with leftover-marker cleanup.
//!
//! The agent runtime leaves `claude-*-cwd` marker files in its temp dir.
//! [`TempWorkspace::prepare`] snapshots the markers that already exist, and
//! [`TempWorkspace::cleanup`] later removes only the markers created since.
//! Each invocation owns its own snapshot; nothing is shared between sends.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::Result;

/// File-name pattern of leftover markers written by the agent runtime.
pub const LEFTOVER_PATTERN: &str = "claude-*-cwd";

/// Scratch directory scoped to one invocation.
#[derive(Debug, Clone)]
pub struct TempWorkspace {
    root: PathBuf,
    snapshot: HashSet<PathBuf>,
}

impl TempWorkspace {
    /// Create `root` if needed and snapshot the markers already in it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the directory cannot be created.
    pub fn prepare(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let snapshot = markers(&root).into_iter().collect::<HashSet<_>>();
        debug!(
            root = %root.display(),
            existing = snapshot.len(),
            "temp workspace prepared"
        );
        Ok(Self { root, snapshot })
    }

    /// Scratch directory handed to the child process.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Markers that predate this invocation.
    #[must_use]
    pub fn snapshot(&self) -> &HashSet<PathBuf> {
        &self.snapshot
    }

    /// Delete markers created during this invocation.
    ///
    /// Individual failures are logged and skipped. Returns the number of
    /// files removed.
    pub fn cleanup(&self) -> usize {
        let mut removed = 0;
        for path in markers(&self.root) {
            if self.snapshot.contains(&path) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(err) => {
                    warn!(path = %path.display(), %err, "failed to remove temp marker");
                }
            }
        }
        if removed > 0 {
            debug!(root = %self.root.display(), removed, "temp workspace cleaned");
        }
        removed
    }
}

/// Marker files currently present in `root`.
fn markers(root: &Path) -> Vec<PathBuf> {
    let pattern = format!(
        "{}/{LEFTOVER_PATTERN}",
        glob::Pattern::escape(&root.to_string_lossy())
    );
    match glob::glob(&pattern) {
        Ok(paths) => paths.filter_map(std::result::Result::ok).collect(),
        Err(err) => {
            warn!(%err, pattern, "invalid temp marker pattern");
            Vec::new()
        }
    }
}
