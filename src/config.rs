//! Bridge configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// How the permission handshake discovers new request files.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WatchMode {
    /// Fixed-interval directory listing.
    #[default]
    Poll,
    /// File-system notifications via `notify`, with an initial scan.
    Notify,
}

/// Configurable timeout values (seconds) for bounded waits.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// How long a permission prompt may stay unanswered before it is denied.
    #[serde(default = "default_permission_seconds")]
    pub permission_seconds: u64,
    /// Grace period between graceful termination and a forced kill.
    #[serde(default = "default_interrupt_grace_seconds")]
    pub interrupt_grace_seconds: u64,
    /// Hard limit for the synchronous query path.
    #[serde(default = "default_query_seconds")]
    pub query_seconds: u64,
    /// Deadline for the slash-command listing.
    #[serde(default = "default_slash_commands_seconds")]
    pub slash_commands_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            permission_seconds: default_permission_seconds(),
            interrupt_grace_seconds: default_interrupt_grace_seconds(),
            query_seconds: default_query_seconds(),
            slash_commands_seconds: default_slash_commands_seconds(),
        }
    }
}

fn default_permission_seconds() -> u64 {
    30
}

fn default_interrupt_grace_seconds() -> u64 {
    3
}

fn default_query_seconds() -> u64 {
    60
}

fn default_slash_commands_seconds() -> u64 {
    20
}

/// Permission handshake tuning.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PermissionConfig {
    /// Interval between directory scans in poll mode.
    #[serde(default = "default_poll_interval_millis")]
    pub poll_interval_millis: u64,
    /// Delay before reading a discovered request, letting the writer finish.
    #[serde(default = "default_settle_millis")]
    pub settle_millis: u64,
    /// Request discovery mechanism.
    #[serde(default)]
    pub watch_mode: WatchMode,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            poll_interval_millis: default_poll_interval_millis(),
            settle_millis: default_settle_millis(),
            watch_mode: WatchMode::default(),
        }
    }
}

fn default_poll_interval_millis() -> u64 {
    500
}

fn default_settle_millis() -> u64 {
    100
}

fn default_runtime_name() -> String {
    "node".into()
}

fn default_bridge_dir() -> PathBuf {
    PathBuf::from("claude-bridge")
}

fn default_channel_script() -> String {
    "channel-manager.js".into()
}

fn default_query_script() -> String {
    "simple-query.js".into()
}

fn default_provider() -> String {
    "claude".into()
}

fn default_permission_mode() -> String {
    "default".into()
}

/// Bridge configuration parsed from `bridge.toml`.
///
/// Every field has a default, so an empty document is a valid configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct BridgeConfig {
    /// Manual override for the runtime executable; wins over auto-detection.
    #[serde(default)]
    pub runtime_path: Option<PathBuf>,
    /// Executable name searched for during auto-detection.
    #[serde(default = "default_runtime_name")]
    pub runtime_name: String,
    /// Directory holding the bridge scripts; also the fallback working directory.
    #[serde(default = "default_bridge_dir")]
    pub bridge_dir: PathBuf,
    /// Script driving multi-turn sends.
    #[serde(default = "default_channel_script")]
    pub channel_script: String,
    /// Script driving the one-shot synchronous query.
    #[serde(default = "default_query_script")]
    pub query_script: String,
    /// Provider argument passed to the channel script.
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Shared directory for permission request/response files.
    #[serde(default)]
    pub permission_dir: Option<PathBuf>,
    /// Scratch directory exported to the child as its temp dir.
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
    /// Extra directories searched for the runtime and appended to `PATH`.
    #[serde(default)]
    pub extra_search_paths: Vec<PathBuf>,
    /// Permission mode used by new sessions.
    #[serde(default = "default_permission_mode")]
    pub default_permission_mode: String,
    /// Model identifier used by new sessions; the agent picks one when absent.
    #[serde(default)]
    pub default_model: Option<String>,
    /// Timeout configuration for bounded waits.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Permission handshake tuning.
    #[serde(default)]
    pub permission: PermissionConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            runtime_path: None,
            runtime_name: default_runtime_name(),
            bridge_dir: default_bridge_dir(),
            channel_script: default_channel_script(),
            query_script: default_query_script(),
            provider: default_provider(),
            permission_dir: None,
            temp_dir: None,
            extra_search_paths: Vec::new(),
            default_permission_mode: default_permission_mode(),
            default_model: None,
            timeouts: TimeoutConfig::default(),
            permission: PermissionConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the file does not exist, and
    /// `AppError::Config` if it cannot be read, contains invalid TOML, or
    /// fails validation.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                AppError::NotFound(format!("config file {}", path.display()))
            } else {
                AppError::Config(format!("failed to read config: {err}"))
            }
        })?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Directory shared with the agent for permission files.
    #[must_use]
    pub fn permission_dir(&self) -> PathBuf {
        self.permission_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("claude-permission"))
    }

    /// Well-known scratch directory handed to each launch.
    #[must_use]
    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("claude-agent-tmp"))
    }

    /// Absolute path of the channel script.
    #[must_use]
    pub fn channel_script_path(&self) -> PathBuf {
        self.bridge_dir.join(&self.channel_script)
    }

    /// Absolute path of the synchronous query script.
    #[must_use]
    pub fn query_script_path(&self) -> PathBuf {
        self.bridge_dir.join(&self.query_script)
    }

    /// Permission prompt timeout.
    #[must_use]
    pub fn permission_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.permission_seconds)
    }

    /// Grace period between graceful termination and forced kill.
    #[must_use]
    pub fn interrupt_grace(&self) -> Duration {
        Duration::from_secs(self.timeouts.interrupt_grace_seconds)
    }

    /// Hard timeout for [`Bridge::query`](crate::bridge::Bridge::query).
    #[must_use]
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.query_seconds)
    }

    /// Deadline for [`Bridge::slash_commands`](crate::bridge::Bridge::slash_commands).
    #[must_use]
    pub fn slash_commands_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.slash_commands_seconds)
    }

    /// Interval between permission directory scans.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.permission.poll_interval_millis)
    }

    /// Delay before a discovered request file is read.
    #[must_use]
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.permission.settle_millis)
    }

    fn validate(&self) -> Result<()> {
        if self.runtime_name.trim().is_empty() {
            return Err(AppError::Config("runtime_name must not be empty".into()));
        }

        if self.channel_script.trim().is_empty() || self.query_script.trim().is_empty() {
            return Err(AppError::Config("script names must not be empty".into()));
        }

        if self.permission.poll_interval_millis == 0 {
            return Err(AppError::Config(
                "permission.poll_interval_millis must be greater than zero".into(),
            ));
        }

        if self.timeouts.permission_seconds == 0 {
            return Err(AppError::Config(
                "timeouts.permission_seconds must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}
