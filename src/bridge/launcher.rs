//! Process launcher.
//!
//! Builds and starts one OS process per logical operation:
//! - working directory: the caller's cwd when it is an existing directory,
//!   otherwise the bridge directory;
//! - environment: inherited, plus `PATH` augmentation, an isolated temp dir,
//!   the permission-directory pointer, project path hints and the channel id;
//! - `kill_on_drop(true)` so an abandoned launch never outlives its owner.
//!
//! The [`Child`] is moved into an exit monitor task immediately after spawn;
//! callers interact with the process only through its [`ProcessHandle`], the
//! three pipes, and the monitor's [`JoinHandle`].

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bridge::SendRequest;
use crate::orchestrator::channel_registry::ProcessHandle;
use crate::{AppError, Result};

// ── Environment keys ─────────────────────────────────────────────────────────

/// Directory where the agent drops permission request files.
pub const ENV_PERMISSION_DIR: &str = "CLAUDE_PERMISSION_DIR";
/// Tells the agent to read its arguments from stdin.
pub const ENV_USE_STDIN: &str = "CLAUDE_USE_STDIN";
/// Channel the process was launched for; echoed back in permission requests.
pub const ENV_CHANNEL_ID: &str = "CLAUDE_CHANNEL_ID";
/// Project path hints.
pub const ENV_PROJECT_PATHS: &[&str] = &["IDEA_PROJECT_PATH", "PROJECT_PATH"];
/// Temp-dir redirection.
pub const ENV_TEMP_DIRS: &[&str] = &["TMPDIR", "TEMP", "TMP"];

// ── Launch description ───────────────────────────────────────────────────────

/// Inputs for [`build_env`].
#[derive(Debug, Clone)]
pub struct EnvContext<'a> {
    /// Value for `PATH`.
    pub path: OsString,
    /// Isolated scratch directory.
    pub temp_dir: Option<&'a Path>,
    /// Permission request/response directory.
    pub permission_dir: &'a Path,
    /// Project directory, when the caller supplied a usable one.
    pub project_dir: Option<&'a Path>,
    /// Launching channel.
    pub channel_id: Option<&'a str>,
    /// Whether arguments arrive on stdin.
    pub use_stdin: bool,
}

/// Environment overrides applied on top of the inherited environment.
#[must_use]
pub fn build_env(ctx: &EnvContext<'_>) -> Vec<(String, OsString)> {
    let mut env = vec![
        ("PATH".to_owned(), ctx.path.clone()),
        (
            ENV_PERMISSION_DIR.to_owned(),
            ctx.permission_dir.as_os_str().to_owned(),
        ),
    ];

    if let Some(temp) = ctx.temp_dir {
        for key in ENV_TEMP_DIRS {
            env.push(((*key).to_owned(), temp.as_os_str().to_owned()));
        }
    }

    if let Some(project) = ctx.project_dir {
        for key in ENV_PROJECT_PATHS {
            env.push(((*key).to_owned(), project.as_os_str().to_owned()));
        }
    }

    if let Some(channel_id) = ctx.channel_id {
        env.push((ENV_CHANNEL_ID.to_owned(), channel_id.into()));
    }

    if ctx.use_stdin {
        env.push((ENV_USE_STDIN.to_owned(), "true".into()));
    }

    env
}

/// A caller-supplied cwd, if it names an existing directory.
///
/// Empty strings and the placeholders `undefined` / `null` that hosts send
/// for "no directory" are rejected.
#[must_use]
pub fn usable_dir(cwd: Option<&str>) -> Option<PathBuf> {
    let cwd = cwd?.trim();
    if cwd.is_empty() || cwd == "undefined" || cwd == "null" {
        return None;
    }
    let path = PathBuf::from(cwd);
    path.is_dir().then_some(path)
}

/// Working directory for a launch: `cwd` when usable, else `fallback`.
#[must_use]
pub fn resolve_working_dir(cwd: Option<&str>, fallback: &Path) -> PathBuf {
    usable_dir(cwd).unwrap_or_else(|| {
        if let Some(requested) = cwd.filter(|c| !c.is_empty()) {
            debug!(requested, fallback = %fallback.display(), "cwd unusable, using bridge dir");
        }
        fallback.to_path_buf()
    })
}

/// Stdin document for a send.
///
/// Absent optional fields are sent as empty strings; `attachments` and
/// `openedFiles` are omitted unless present.
#[must_use]
pub fn build_payload(request: &SendRequest) -> Value {
    let mut payload = Map::new();
    payload.insert("message".into(), Value::String(request.message.clone()));
    for (key, value) in [
        ("sessionId", &request.session_id),
        ("cwd", &request.cwd),
        ("permissionMode", &request.permission_mode),
        ("model", &request.model),
    ] {
        payload.insert(key.into(), Value::String(value.clone().unwrap_or_default()));
    }

    if !request.attachments.is_empty() {
        payload.insert("attachments".into(), json!(request.attachments));
    }

    if let Some(opened) = request
        .opened_files
        .as_ref()
        .filter(|v| v.as_object().is_some_and(|o| !o.is_empty()))
    {
        payload.insert("openedFiles".into(), opened.clone());
    }

    Value::Object(payload)
}

/// Everything needed to start one process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Executable.
    pub program: PathBuf,
    /// Arguments.
    pub args: Vec<OsString>,
    /// Working directory.
    pub working_dir: PathBuf,
    /// Overrides applied on top of the inherited environment.
    pub env: Vec<(String, OsString)>,
}

/// A running process, its pipes, and its exit monitor.
#[derive(Debug)]
pub struct LaunchedProcess {
    /// Handle used for registration and interruption.
    pub handle: ProcessHandle,
    /// Child stdin; taken by the caller and closed after writing.
    pub stdin: Option<ChildStdin>,
    /// Child stdout.
    pub stdout: ChildStdout,
    /// Child stderr.
    pub stderr: ChildStderr,
    /// Resolves to the exit code (`None` if killed by a signal).
    pub exit: JoinHandle<Option<i32>>,
}

/// Start the process described by `spec`.
///
/// # Errors
///
/// Returns `AppError::Spawn` if the OS refuses to start the process or a
/// pipe cannot be captured.
pub fn launch(label: &str, spec: &LaunchSpec) -> Result<LaunchedProcess> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(&spec.working_dir)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_os_str())))
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|err| {
        AppError::Spawn(format!(
            "failed to start {}: {err}",
            spec.program.display()
        ))
    })?;

    let stdin = child.stdin.take();
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture process stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture process stderr".into()))?;

    let handle = ProcessHandle::new(child.id());
    info!(
        label,
        pid = ?handle.pid(),
        program = %spec.program.display(),
        cwd = %spec.working_dir.display(),
        "process launched"
    );

    let exit = monitor_exit(label.to_owned(), child, handle.clone());

    Ok(LaunchedProcess {
        handle,
        stdin,
        stdout,
        stderr,
        exit,
    })
}

/// Own `child` until it exits or a kill is requested through `handle`.
///
/// Fires the handle's `exited` token once the process has been reaped.
#[must_use]
pub fn monitor_exit(label: String, mut child: Child, handle: ProcessHandle) -> JoinHandle<Option<i32>> {
    let kill = handle.kill_token();
    tokio::spawn(async move {
        let waited = tokio::select! {
            status = child.wait() => Some(status),
            () = kill.cancelled() => None,
        };

        let status = match waited {
            Some(status) => status,
            None => {
                debug!(label, "monitor_exit: forced kill requested");
                if let Err(err) = child.start_kill() {
                    debug!(label, %err, "start_kill failed, process likely gone");
                }
                child.wait().await
            }
        };

        handle.mark_exited();

        match status {
            Ok(status) => {
                debug!(label, code = ?status.code(), "process exited");
                status.code()
            }
            Err(err) => {
                warn!(label, %err, "error waiting for child process");
                None
            }
        }
    })
}

/// Write `payload` to `stdin` and close it.
///
/// Failures are logged only: a process that does not need its input may
/// still succeed.
pub async fn write_stdin(label: &str, stdin: Option<ChildStdin>, payload: &[u8]) {
    let Some(mut stdin) = stdin else {
        warn!(label, "process stdin unavailable, payload not written");
        return;
    };

    if let Err(err) = stdin.write_all(payload).await {
        warn!(label, %err, "failed to write stdin payload");
        return;
    }
    if let Err(err) = stdin.shutdown().await {
        debug!(label, %err, "failed to close stdin");
    }
}
