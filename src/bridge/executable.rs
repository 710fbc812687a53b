//! Runtime executable resolution.
//!
//! Search order:
//!
//! 1. Manual override ([`ExecutableResolver::set_override`] or
//!    `runtime_path` in config), when it points at an existing file.
//! 2. `which` lookup of the runtime name on the inherited `PATH`.
//! 3. Well-known install directories, then `extra_search_paths`.
//!
//! The auto-detected path is cached for the lifetime of the resolver; the
//! override is re-checked on every call so it can change at runtime.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::{AppError, Result};

/// Resolves and caches the path of the external runtime executable.
#[derive(Debug)]
pub struct ExecutableResolver {
    runtime_name: String,
    search_dirs: Vec<PathBuf>,
    manual: RwLock<Option<PathBuf>>,
    detected: OnceCell<PathBuf>,
}

impl ExecutableResolver {
    /// Build a resolver from configuration.
    #[must_use]
    pub fn new(config: &BridgeConfig) -> Self {
        let mut search_dirs = well_known_dirs();
        for extra in &config.extra_search_paths {
            if !search_dirs.contains(extra) {
                search_dirs.push(extra.clone());
            }
        }

        Self {
            runtime_name: config.runtime_name.clone(),
            search_dirs,
            manual: RwLock::new(config.runtime_path.clone()),
            detected: OnceCell::new(),
        }
    }

    /// Set or clear the manual override.
    pub async fn set_override(&self, path: Option<PathBuf>) {
        info!(path = ?path, "runtime executable override changed");
        *self.manual.write().await = path;
    }

    /// Current manual override, if any.
    pub async fn override_path(&self) -> Option<PathBuf> {
        self.manual.read().await.clone()
    }

    /// Resolve the runtime executable.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Spawn` when no candidate exists.
    pub async fn resolve(&self) -> Result<PathBuf> {
        if let Some(manual) = self.manual.read().await.as_ref() {
            if manual.is_file() {
                return Ok(manual.clone());
            }
            warn!(
                path = %manual.display(),
                "configured runtime path does not exist, falling back to auto-detection"
            );
        }

        self.detected
            .get_or_try_init(|| async { self.detect() })
            .await
            .cloned()
    }

    /// `PATH` value for a child launched with `runtime`.
    ///
    /// The runtime's own directory comes first, followed by the inherited
    /// `PATH`, then any search directory not already present. A minimal
    /// inherited environment still ends up with the common locations.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Spawn` if a directory contains the platform path
    /// separator.
    pub fn child_path(&self, runtime: &Path) -> Result<OsString> {
        let mut dirs: Vec<PathBuf> = Vec::new();
        if let Some(parent) = runtime.parent().filter(|p| !p.as_os_str().is_empty()) {
            dirs.push(parent.to_path_buf());
        }
        if let Some(inherited) = std::env::var_os("PATH") {
            dirs.extend(std::env::split_paths(&inherited));
        }
        for dir in &self.search_dirs {
            dirs.push(dir.clone());
        }

        let mut unique: Vec<PathBuf> = Vec::with_capacity(dirs.len());
        for dir in dirs {
            if !unique.contains(&dir) {
                unique.push(dir);
            }
        }

        std::env::join_paths(unique)
            .map_err(|err| AppError::Spawn(format!("cannot build PATH for child: {err}")))
    }

    fn detect(&self) -> Result<PathBuf> {
        match which::which(&self.runtime_name) {
            Ok(path) => {
                info!(path = %path.display(), "runtime found on PATH");
                return Ok(path);
            }
            Err(err) => {
                debug!(runtime = self.runtime_name.as_str(), %err, "runtime not on PATH");
            }
        }

        for dir in &self.search_dirs {
            let candidate = dir.join(executable_file_name(&self.runtime_name));
            debug!(candidate = %candidate.display(), "probing runtime location");
            if candidate.is_file() {
                info!(path = %candidate.display(), "runtime found in well-known location");
                return Ok(candidate);
            }
        }

        Err(AppError::Spawn(format!(
            "runtime `{}` not found on PATH or in {} well-known locations",
            self.runtime_name,
            self.search_dirs.len()
        )))
    }
}

fn executable_file_name(name: &str) -> String {
    if cfg!(windows) && Path::new(name).extension().is_none() {
        format!("{name}.exe")
    } else {
        name.to_owned()
    }
}

/// Install locations probed when the runtime is not on `PATH`.
fn well_known_dirs() -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = ["/usr/local/bin", "/opt/homebrew/bin", "/usr/bin"]
        .iter()
        .map(PathBuf::from)
        .collect();

    if let Some(home) = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE")) {
        let home = PathBuf::from(home);
        dirs.push(home.join(".volta").join("bin"));
        dirs.push(home.join(".local").join("bin"));
    }

    dirs
}
