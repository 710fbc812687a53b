//! End-to-end send tests against a `sh` script standing in for the agent.

#![cfg(unix)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use agent_bridge::bridge::protocol::StreamEvent;
use agent_bridge::bridge::{Bridge, SendOutcome, SendRequest};
use agent_bridge::models::message::MessageKind;
use agent_bridge::orchestrator::session::{HistoryLoader, Session, SessionEvent};
use agent_bridge::{AppError, Result};

use super::common::script_config;

const HELLO_AGENT: &str = r#"
dir=$(dirname "$0")
cat > "$dir/payload.json"
printf '%s\n' "$CLAUDE_CHANNEL_ID" > "$dir/channel.txt"
printf '%s\n' "$TMPDIR" > "$dir/tmpdir.txt"
printf '%s\n' "$1 $2" > "$dir/args.txt"
touch "$TMPDIR/claude-fresh-cwd"
echo "[MESSAGE_START]"
echo "[SESSION_ID]sess-123"
echo "[CONTENT_DELTA]Hel"
echo "[CONTENT_DELTA]lo"
echo "[MESSAGE_END]"
exit 0
"#;

fn drain(events: &mut mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

/// A fresh session sends "hello": USER first, then a streamed ASSISTANT
/// message, then a successful completion.
#[tokio::test]
async fn hello_on_fresh_session_streams_and_completes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = script_config(dir.path(), HELLO_AGENT);
    let bridge = Bridge::new(config.clone());
    let (session, mut events) = Session::new(bridge.clone(), Arc::new(bridge.clone()), &config);
    assert!(session.channel_id().await.is_none());

    let outcome = session.send("hello", Vec::new()).await;

    assert_eq!(outcome, SendOutcome::Completed);
    let messages = session.messages().await;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].kind, MessageKind::User);
    assert_eq!(messages[0].content, "hello");
    assert_eq!(messages[1].kind, MessageKind::Assistant);
    assert_eq!(messages[1].content, "Hello");
    assert_eq!(session.session_id().await.as_deref(), Some("sess-123"));
    assert_eq!(session.summary().await.as_deref(), Some("hello"));
    assert!(!session.state().await.busy);

    let events = drain(&mut events);
    let Some(SessionEvent::MessagesUpdated(first)) = events.first() else {
        panic!("first event must be the optimistic user message");
    };
    assert_eq!(first.len(), 1);
    assert!(events.contains(&SessionEvent::SessionIdReceived("sess-123".into())));
    assert_eq!(events.last(), Some(&SessionEvent::Completed(SendOutcome::Completed)));

    let channel = session.channel_id().await.expect("channel created lazily");
    let payload: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join("payload.json")).expect("payload"),
    )
    .expect("payload json");
    assert_eq!(payload["message"], "hello");
    assert_eq!(payload["permissionMode"], "default");
    assert_eq!(
        std::fs::read_to_string(dir.path().join("channel.txt")).expect("channel").trim(),
        channel
    );
    assert_eq!(
        std::fs::read_to_string(dir.path().join("args.txt")).expect("args").trim(),
        "claude send"
    );
    assert!(
        !dir.path().join("tmp").join("claude-fresh-cwd").exists(),
        "marker created during the send must be cleaned up"
    );
    assert_eq!(bridge.active_process_count().await, 0);
}

/// An interrupt before exit yields a completion, not an error.
#[tokio::test]
async fn interrupt_before_exit_is_not_a_failure() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = script_config(
        dir.path(),
        "cat > /dev/null\necho \"[CONTENT_DELTA]working\"\nexec sleep 30\n",
    );
    let bridge = Bridge::new(config.clone());
    let (session, mut events) = Session::new(bridge.clone(), Arc::new(bridge.clone()), &config);

    let turn = {
        let session = session.clone();
        tokio::spawn(async move { session.send("long task", Vec::new()).await })
    };

    let streaming = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(event) = events.recv().await {
            if let SessionEvent::MessagesUpdated(messages) = event {
                if messages.last().is_some_and(|m| m.content == "working") {
                    return;
                }
            }
        }
    })
    .await;
    assert!(streaming.is_ok(), "agent output must arrive");

    session.interrupt().await;
    let outcome = tokio::time::timeout(Duration::from_secs(10), turn)
        .await
        .expect("send must finish after interrupt")
        .expect("send task");

    assert_eq!(outcome, SendOutcome::Interrupted);
    let state = session.state().await;
    assert!(!state.busy);
    assert_eq!(state.error, None);
    assert!(session
        .messages()
        .await
        .iter()
        .all(|m| m.kind != MessageKind::Error));
    assert_eq!(bridge.active_process_count().await, 0);
}

#[tokio::test]
async fn shutdown_interrupts_running_channels() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = script_config(
        dir.path(),
        "cat > /dev/null\necho \"[CONTENT_DELTA]busy\"\nexec sleep 30\n",
    );
    let bridge = Bridge::new(config);
    let (tx, mut rx) = mpsc::channel(16);

    let send = {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.send_message(SendRequest::new("ch", "hi"), tx).await })
    };
    let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event before timeout");
    assert_eq!(first, Some(StreamEvent::ContentDelta("busy".into())));
    assert_eq!(bridge.active_process_count().await, 1);

    assert_eq!(bridge.shutdown().await, 1);
    let result = tokio::time::timeout(Duration::from_secs(10), send)
        .await
        .expect("send must finish after shutdown")
        .expect("send task");

    assert_eq!(result.outcome, SendOutcome::Interrupted);
    assert_eq!(bridge.active_process_count().await, 0);
    assert_eq!(bridge.shutdown().await, 0);
}

#[tokio::test]
async fn send_error_is_surfaced_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = script_config(
        dir.path(),
        "cat > /dev/null\necho '[SEND_ERROR]{\"error\":\"quota exceeded\"}'\nexit 1\n",
    );
    let bridge = Bridge::new(config.clone());
    let (session, _events) = Session::new(bridge.clone(), Arc::new(bridge), &config);

    let outcome = session.send("hi", Vec::new()).await;

    assert_eq!(outcome, SendOutcome::Failed(AppError::Send("quota exceeded".into())));
    let errors: Vec<_> = session
        .messages()
        .await
        .into_iter()
        .filter(|m| m.kind == MessageKind::Error)
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].content, "quota exceeded");
    let state = session.state().await;
    assert!(!state.busy);
    assert_eq!(state.error.as_deref(), Some("quota exceeded"));
}

#[tokio::test]
async fn nonzero_exit_reports_last_diagnostic() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = script_config(
        dir.path(),
        "cat > /dev/null\necho '[UNCAUGHT_ERROR] boom' >&2\nexit 2\n",
    );
    let bridge = Bridge::new(config);
    let (tx, _rx) = mpsc::channel(16);

    let result = bridge.send_message(SendRequest::new("ch", "hi"), tx).await;

    assert_eq!(result.exit_code, Some(2));
    assert_eq!(
        result.outcome,
        SendOutcome::Failed(AppError::ProcessExit(
            "process exited with code 2 | last error: [UNCAUGHT_ERROR] boom".into()
        ))
    );
}

#[tokio::test]
async fn missing_runtime_fails_fast_with_spawn_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = script_config(dir.path(), "exit 0\n");
    config.runtime_path = Some(dir.path().join("no-such-runtime"));
    config.runtime_name = "agent-bridge-missing-runtime".into();
    let bridge = Bridge::new(config.clone());
    let (session, _events) = Session::new(bridge.clone(), Arc::new(bridge.clone()), &config);

    let outcome = session.send("hi", Vec::new()).await;

    assert!(matches!(outcome, SendOutcome::Failed(AppError::Spawn(_))), "got {outcome:?}");
    assert!(!session.state().await.busy);
    assert_eq!(
        session.messages().await.last().map(|m| m.kind),
        Some(MessageKind::Error)
    );
    assert!(!bridge.check_environment().await);
}

/// `[MESSAGE_END]` reaches the caller before the process exits.
#[tokio::test]
async fn message_end_arrives_before_exit() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = script_config(
        dir.path(),
        "cat > /dev/null\necho '[MESSAGE_END]'\nsleep 1\nexit 0\n",
    );
    let bridge = Bridge::new(config);
    let (tx, mut rx) = mpsc::channel(16);

    let send = tokio::spawn(async move { bridge.send_message(SendRequest::new("ch", "hi"), tx).await });

    let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event before timeout");
    assert_eq!(first, Some(StreamEvent::MessageEnd));
    assert!(!send.is_finished(), "process is still running after the end marker");

    let result = send.await.expect("send task");
    assert_eq!(result.outcome, SendOutcome::Completed);
    assert!(result.summary.saw_message_end);
}

const MULTI_COMMAND_AGENT: &str = r#"
case "$2" in
  getSession)
    echo "loading $3"
    echo '{"success":true,"messages":[{"type":"user","message":{"content":"earlier"}}]}'
    ;;
  getSlashCommands)
    cat > /dev/null
    echo '[SLASH_COMMANDS][{"name":"/help","description":"Show help"}]'
    exec sleep 30
    ;;
  *)
    cat > /dev/null
    echo "[Assistant]: four"
    echo "[JSON_START]"
    echo '{"success":true,"messageCount":2}'
    echo "[JSON_END]"
    ;;
esac
"#;

#[tokio::test]
async fn one_shot_operations() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = script_config(dir.path(), MULTI_COMMAND_AGENT);
    let bridge = Bridge::new(config.clone());

    let query = bridge.query("2+2").await.expect("query");
    assert!(query.success);
    assert_eq!(query.message_count, 2);
    assert_eq!(query.final_result.as_deref(), Some("four"));

    let history = bridge.session_messages("s-1", None).await.expect("history");
    assert_eq!(history.len(), 1);

    let commands = tokio::time::timeout(Duration::from_secs(4), bridge.slash_commands(None))
        .await
        .expect("returns as soon as the tagged line arrives")
        .expect("slash commands");
    assert_eq!(commands[0]["name"], "/help");

    let (session, _events) = Session::new(bridge.clone(), Arc::new(bridge.clone()), &config);
    session.set_session_info(Some("s-1".into()), None).await;
    assert_eq!(session.load_from_server().await.expect("load"), 1);
    assert_eq!(session.messages().await[0].content, "earlier");
}

#[tokio::test]
async fn query_timeout_kills_process() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = script_config(dir.path(), "exec sleep 30\n");
    config.timeouts.query_seconds = 1;
    let bridge = Bridge::new(config);

    let err = bridge.query("slow").await.expect_err("must time out");

    assert!(matches!(err, AppError::Timeout(_)));
}

struct StoredHistory(Vec<Value>);

impl HistoryLoader for StoredHistory {
    fn load_history<'a>(
        &'a self,
        _session_id: &'a str,
        _cwd: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Value>>> + Send + 'a>> {
        let messages = self.0.clone();
        Box::pin(async move { Ok(messages) })
    }
}

/// Loading history mid-turn leaves the loaded messages untouched; the live
/// turn continues in a message of its own.
#[tokio::test]
async fn history_load_during_send_keeps_loaded_messages() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = script_config(
        dir.path(),
        r#"
dir=$(dirname "$0")
cat > /dev/null
echo "[CONTENT_DELTA]one"
while [ ! -f "$dir/go" ]; do sleep 0.05; done
echo '[MESSAGE]{"type":"assistant","message":{"content":[{"type":"text","text":"onetwo"}]}}'
echo "[CONTENT_DELTA]!"
"#,
    );
    let history = vec![
        json!({"type": "user", "message": {"content": "q"}}),
        json!({"type": "assistant", "message": {"content": "a"}}),
        json!({"type": "user", "message": {"content": "q2"}}),
    ];
    let bridge = Bridge::new(config.clone());
    let (session, mut events) =
        Session::new(bridge, Arc::new(StoredHistory(history.clone())), &config);
    session.set_session_info(Some("s-1".into()), None).await;

    let turn = {
        let session = session.clone();
        tokio::spawn(async move { session.send("hi", Vec::new()).await })
    };
    let streaming = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(event) = events.recv().await {
            if let SessionEvent::MessagesUpdated(messages) = event {
                if messages.last().is_some_and(|m| m.content == "one") {
                    return;
                }
            }
        }
    })
    .await;
    assert!(streaming.is_ok(), "first delta must arrive");

    assert_eq!(session.load_from_server().await.expect("load"), 3);
    std::fs::write(dir.path().join("go"), "").expect("release agent");
    let drain = tokio::spawn(async move { while events.recv().await.is_some() {} });

    let outcome = tokio::time::timeout(Duration::from_secs(10), turn)
        .await
        .expect("send must finish")
        .expect("send task");
    assert_eq!(outcome, SendOutcome::Completed);

    let messages = session.messages().await;
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[1].kind, MessageKind::Assistant);
    assert_eq!(messages[1].content, "a");
    assert_eq!(messages[1].raw.as_ref(), Some(&history[1]));
    assert_eq!(messages[3].kind, MessageKind::Assistant);
    assert_eq!(messages[3].content, "onetwo!");
    drop(session);
    drain.abort();
}

#[tokio::test]
async fn assistant_chunk_without_content_adds_no_message() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = script_config(
        dir.path(),
        r#"
cat > /dev/null
echo '[MESSAGE]{"type":"assistant","message":{"content":[]}}'
echo '[MESSAGE]{"type":"assistant","message":{"content":[{"type":"text","text":"done"}]}}'
"#,
    );
    let bridge = Bridge::new(config.clone());
    let (session, _events) = Session::new(bridge.clone(), Arc::new(bridge), &config);

    assert_eq!(session.send("hi", Vec::new()).await, SendOutcome::Completed);

    let messages = session.messages().await;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].kind, MessageKind::Assistant);
    assert_eq!(messages[1].content, "done");
}
