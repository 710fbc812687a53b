#![forbid(unsafe_code)]

//! `agent-bridge`: terminal host for the agent bridge.
//!
//! Loads configuration, starts the permission service, and runs one prompt
//! (or prints a stored conversation) through a [`Session`].

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_bridge::bridge::{Bridge, SendOutcome};
use agent_bridge::models::message::{Message, MessageKind};
use agent_bridge::models::permission::{PermissionDecision, PermissionRequest};
use agent_bridge::orchestrator::session::{Session, SessionEvent};
use agent_bridge::permission::prompt::PermissionPrompt;
use agent_bridge::permission::service::PermissionService;
use agent_bridge::permission::source;
use agent_bridge::{AppError, BridgeConfig, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-bridge", about = "Drive a stdio agent runtime from the terminal", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Project directory the agent works in.
    #[arg(long)]
    cwd: Option<String>,

    /// Resume an existing conversation.
    #[arg(long)]
    session: Option<String>,

    /// Agent permission mode.
    #[arg(long)]
    permission_mode: Option<String>,

    /// Model identifier.
    #[arg(long)]
    model: Option<String>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Prompt to send. Without it, a resumed conversation is printed.
    prompt: Option<String>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let config = match &args.config {
        Some(path) => BridgeConfig::load_from_path(path)?,
        None => BridgeConfig::default(),
    };
    info!("configuration loaded");

    let bridge = Bridge::new(config.clone());
    if !bridge.check_environment().await {
        warn!("agent runtime failed its version check, sends will likely fail");
    }

    // ── Permission service ──────────────────────────────
    let cancel = CancellationToken::new();
    let wake = Arc::new(Notify::new());
    let service = PermissionService::new(&config, Arc::new(TerminalPrompt));
    let service_task = service.spawn(source::from_config(&config, Arc::clone(&wake))?, cancel.clone());

    // ── Session ─────────────────────────────────────────
    let (session, events) = Session::new(bridge.clone(), Arc::new(bridge.clone()), &config);
    let session = session.with_permission_wake(wake);
    session.set_session_info(args.session.clone(), args.cwd.clone()).await;
    if let Some(mode) = args.permission_mode {
        session.set_permission_mode(mode).await;
    }
    if args.model.is_some() {
        session.set_model(args.model).await;
    }

    let printer = tokio::spawn(print_events(events));
    let watcher = {
        let session = session.clone();
        let decisions = service.subscribe();
        tokio::spawn(async move { session.watch_permission_denials(decisions).await; })
    };

    let result = match args.prompt {
        Some(prompt) => send_prompt(&session, prompt).await,
        None if args.session.is_some() => session.load_from_server().await.map(|count| {
            info!(count, "conversation loaded");
        }),
        None => Err(AppError::Config("nothing to do: pass a prompt or --session".into())),
    };

    // ── Shutdown ────────────────────────────────────────
    bridge.shutdown().await;
    cancel.cancel();
    watcher.abort();
    if let Err(err) = watcher.await {
        if !err.is_cancelled() {
            error!(%err, "permission watcher task failed");
        }
    }
    if let Err(err) = service_task.await {
        error!(%err, "permission service task failed");
    }
    drop(session);
    if let Err(err) = printer.await {
        error!(%err, "event printer task failed");
    }

    result
}

/// Send `prompt`, interrupting the turn on Ctrl-C.
async fn send_prompt(session: &Session, prompt: String) -> Result<()> {
    let mut turn = {
        let session = session.clone();
        tokio::spawn(async move { session.send(&prompt, Vec::new()).await })
    };

    let joined = tokio::select! {
        joined = &mut turn => joined,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt requested");
            session.interrupt().await;
            turn.await
        }
    };

    match joined.map_err(|err| AppError::Send(format!("send task failed: {err}")))? {
        SendOutcome::Completed | SendOutcome::Interrupted => Ok(()),
        SendOutcome::Failed(err) => Err(err),
    }
}

/// Stream assistant text to stdout as it grows.
async fn print_events(mut events: mpsc::Receiver<SessionEvent>) {
    let mut printed = 0usize;
    let mut tracked: Option<usize> = None;
    let mut stdout = std::io::stdout();

    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::MessagesUpdated(messages) => {
                let Some((idx, last)) = messages.iter().enumerate().last() else {
                    continue;
                };
                if tracked != Some(idx) {
                    tracked = Some(idx);
                    printed = 0;
                    if last.kind != MessageKind::Assistant {
                        if let Err(err) = print_message(&mut stdout, last) {
                            debug!(%err, "failed to write message");
                        }
                        printed = last.content.len();
                        continue;
                    }
                }
                if last.kind == MessageKind::Assistant {
                    let tail = last.content.get(printed..).unwrap_or(last.content.as_str());
                    if let Err(err) = write!(stdout, "{tail}").and_then(|()| stdout.flush()) {
                        debug!(%err, "failed to write agent output");
                    }
                    printed = last.content.len();
                }
            }
            SessionEvent::SessionIdReceived(id) => info!(session_id = id.as_str(), "session id"),
            SessionEvent::PermissionRequested { tool_name } => {
                info!(tool = ?tool_name, "agent is waiting for permission");
            }
            SessionEvent::Completed(outcome) => {
                if let Err(err) = writeln!(stdout) {
                    debug!(%err, "failed to write turn separator");
                }
                info!(success = outcome.is_success(), "turn finished");
            }
            SessionEvent::StateChanged(_)
            | SessionEvent::Thinking(_)
            | SessionEvent::ToolResult(_)
            | SessionEvent::SlashCommands(_) => {}
        }
    }
}

fn print_message(out: &mut impl Write, message: &Message) -> std::io::Result<()> {
    let label = match message.kind {
        MessageKind::User => "you",
        MessageKind::Assistant => "agent",
        MessageKind::System => "system",
        MessageKind::Error => "error",
    };
    writeln!(out, "[{label}] {}", message.content)
}

/// Asks on the terminal; answers `y`, `a` (always) or anything else (deny).
struct TerminalPrompt;

impl PermissionPrompt for TerminalPrompt {
    fn decide<'a>(
        &'a self,
        request: &'a PermissionRequest,
    ) -> Pin<Box<dyn std::future::Future<Output = PermissionDecision> + Send + 'a>> {
        let question = format!(
            "\nallow {} {}? [y]es / [a]lways / [N]o: ",
            request.tool_name, request.inputs
        );
        Box::pin(async move {
            let answer = tokio::task::spawn_blocking(move || {
                let mut stderr = std::io::stderr();
                if let Err(err) = write!(stderr, "{question}").and_then(|()| stderr.flush()) {
                    debug!(%err, "failed to write permission question");
                }
                let mut line = String::new();
                std::io::stdin().lock().read_line(&mut line).map(|_| line)
            })
            .await;

            let Ok(Ok(line)) = answer else {
                return PermissionDecision::Deny;
            };
            match line.trim().to_ascii_lowercase().as_str() {
                "y" | "yes" => PermissionDecision::Allow,
                "a" | "always" => PermissionDecision::AllowAlways,
                _ => PermissionDecision::Deny,
            }
        })
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
