//! Integration tests for the permission handshake.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use agent_bridge::config::BridgeConfig;
use agent_bridge::models::permission::{PermissionDecision, PermissionRequest};
use agent_bridge::permission::prompt::{FixedPrompt, PermissionPrompt};
use agent_bridge::permission::service::PermissionService;
use agent_bridge::permission::source::{NotifySource, PollingSource, RequestSource};

/// Prompt answering with a fixed decision and counting how often it is asked.
struct CountingPrompt {
    decision: PermissionDecision,
    calls: AtomicUsize,
}

impl CountingPrompt {
    fn new(decision: PermissionDecision) -> Arc<Self> {
        Arc::new(Self {
            decision,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PermissionPrompt for CountingPrompt {
    fn decide<'a>(
        &'a self,
        _request: &'a PermissionRequest,
    ) -> Pin<Box<dyn Future<Output = PermissionDecision> + Send + 'a>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let decision = self.decision;
        Box::pin(async move { decision })
    }
}

/// Prompt that never answers.
struct SilentPrompt;

impl PermissionPrompt for SilentPrompt {
    fn decide<'a>(
        &'a self,
        _request: &'a PermissionRequest,
    ) -> Pin<Box<dyn Future<Output = PermissionDecision> + Send + 'a>> {
        Box::pin(std::future::pending())
    }
}

fn config(dir: &Path) -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.permission_dir = Some(dir.to_path_buf());
    config.permission.settle_millis = 0;
    config.permission.poll_interval_millis = 50;
    config.timeouts.permission_seconds = 1;
    config
}

fn write_request(dir: &Path, id: &str, tool: &str, inputs: &Value) -> std::path::PathBuf {
    let path = dir.join(format!("request-{id}.json"));
    let body = json!({"requestId": id, "toolName": tool, "inputs": inputs});
    std::fs::write(&path, body.to_string()).expect("write request");
    path
}

fn read_response(dir: &Path, id: &str) -> Value {
    let raw = std::fs::read_to_string(dir.join(format!("response-{id}.json"))).expect("response");
    serde_json::from_str(&raw).expect("response json")
}

/// A denial is not remembered: the identical request prompts again.
#[tokio::test]
async fn denied_fingerprint_prompts_again() {
    let dir = tempfile::tempdir().expect("tempdir");
    let prompt = CountingPrompt::new(PermissionDecision::Deny);
    let service = PermissionService::new(&config(dir.path()), prompt.clone());
    let inputs = json!({"command": "rm -rf /"});

    let first = write_request(dir.path(), "r1", "Bash", &inputs);
    let record = service.handle_request(&first).await.expect("handle").expect("resolved");
    assert_eq!(record.decision, PermissionDecision::Deny);
    assert!(!record.remembered);

    let second = write_request(dir.path(), "r2", "Bash", &inputs);
    service.handle_request(&second).await.expect("handle");

    assert_eq!(prompt.calls(), 2, "prompt must be invoked a second time");
    assert_eq!(read_response(dir.path(), "r1"), json!({"allow": false}));
    assert_eq!(read_response(dir.path(), "r2"), json!({"allow": false}));
    assert!(!first.exists() && !second.exists(), "request files are deleted");
}

#[tokio::test]
async fn allow_always_resolves_identical_requests_silently() {
    let dir = tempfile::tempdir().expect("tempdir");
    let prompt = CountingPrompt::new(PermissionDecision::AllowAlways);
    let service = PermissionService::new(&config(dir.path()), prompt.clone());
    let inputs = json!({"file_path": "/work/a.rs"});

    let first = write_request(dir.path(), "r1", "Read", &inputs);
    service.handle_request(&first).await.expect("handle");
    let second = write_request(dir.path(), "r2", "Read", &inputs);
    let record = service.handle_request(&second).await.expect("handle").expect("resolved");

    assert_eq!(prompt.calls(), 1);
    assert!(record.remembered);
    assert_eq!(read_response(dir.path(), "r2"), json!({"allow": true}));
}

#[tokio::test]
async fn one_time_allow_is_not_remembered() {
    let dir = tempfile::tempdir().expect("tempdir");
    let prompt = CountingPrompt::new(PermissionDecision::Allow);
    let service = PermissionService::new(&config(dir.path()), prompt.clone());
    let inputs = json!({});

    for id in ["r1", "r2"] {
        let path = write_request(dir.path(), id, "Write", &inputs);
        service.handle_request(&path).await.expect("handle");
        assert_eq!(read_response(dir.path(), id), json!({"allow": true}));
    }

    assert_eq!(prompt.calls(), 2);
    assert!(service.memory().is_empty().await);
}

#[tokio::test]
async fn unanswered_prompt_times_out_as_deny() {
    let dir = tempfile::tempdir().expect("tempdir");
    let service = PermissionService::new(&config(dir.path()), Arc::new(SilentPrompt));
    let path = write_request(dir.path(), "r1", "Bash", &json!({"command": "ls"}));

    let record = tokio::time::timeout(Duration::from_secs(5), service.handle_request(&path))
        .await
        .expect("bounded by the permission timeout")
        .expect("handle")
        .expect("resolved");

    assert_eq!(record.decision, PermissionDecision::Deny);
    assert_eq!(read_response(dir.path(), "r1"), json!({"allow": false}));
}

#[tokio::test]
async fn malformed_request_is_denied() {
    let dir = tempfile::tempdir().expect("tempdir");
    let prompt = CountingPrompt::new(PermissionDecision::Allow);
    let service = PermissionService::new(&config(dir.path()), prompt.clone());
    let path = dir.path().join("request-bad.json");
    std::fs::write(&path, "{not json").expect("write");

    let record = service.handle_request(&path).await.expect("handle").expect("resolved");

    assert_eq!(record.decision, PermissionDecision::Deny);
    assert_eq!(prompt.calls(), 0);
    assert_eq!(read_response(dir.path(), "bad"), json!({"allow": false}));
    assert!(!path.exists());
}

#[tokio::test]
async fn vanished_request_is_skipped() {
    let dir = tempfile::tempdir().expect("tempdir");
    let service = PermissionService::new(&config(dir.path()), Arc::new(FixedPrompt(PermissionDecision::Allow)));

    let outcome = service
        .handle_request(&dir.path().join("request-gone.json"))
        .await
        .expect("handle");

    assert!(outcome.is_none());
    assert!(!dir.path().join("response-gone.json").exists());
}

#[tokio::test]
async fn non_request_path_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let service = PermissionService::new(&config(dir.path()), Arc::new(FixedPrompt(PermissionDecision::Allow)));
    assert!(service.handle_request(&dir.path().join("notes.txt")).await.is_err());
}

/// The background loop picks up dropped files and broadcasts decisions.
#[tokio::test]
async fn polling_service_resolves_and_broadcasts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = config(dir.path());
    let service = PermissionService::new(&config, Arc::new(FixedPrompt(PermissionDecision::Allow)));
    let mut decisions = service.subscribe();
    let cancel = CancellationToken::new();
    let source = PollingSource::new(dir.path().to_path_buf(), config.poll_interval(), Arc::new(Notify::new()));
    let task = service.spawn(Box::new(source), cancel.clone());

    let mut body = json!({"requestId": "r9", "toolName": "Edit", "inputs": {}});
    body["channelId"] = json!("ch-7");
    std::fs::write(dir.path().join("request-r9.json"), body.to_string()).expect("write");

    let record = tokio::time::timeout(Duration::from_secs(5), decisions.recv())
        .await
        .expect("decision before timeout")
        .expect("decision");

    assert_eq!(record.request_id, "r9");
    assert_eq!(record.channel_id.as_deref(), Some("ch-7"));
    assert!(record.decision.is_allow());
    assert_eq!(read_response(dir.path(), "r9"), json!({"allow": true}));

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("service stops on cancel")
        .expect("service task");
}

#[tokio::test]
async fn polling_source_wakes_early() {
    let dir = tempfile::tempdir().expect("tempdir");
    let wake = Arc::new(Notify::new());
    let mut source = PollingSource::new(dir.path().to_path_buf(), Duration::from_secs(60), Arc::clone(&wake));

    assert!(source.next_batch().await.is_empty(), "first scan is immediate");

    write_request(dir.path(), "r1", "Bash", &json!({}));
    wake.notify_one();
    let batch = tokio::time::timeout(Duration::from_secs(5), source.next_batch())
        .await
        .expect("wake cuts the interval short");

    assert_eq!(batch, vec![dir.path().join("request-r1.json")]);
}

#[tokio::test]
async fn notify_source_starts_with_a_scan() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_request(dir.path(), "early", "Bash", &json!({}));

    let mut source = NotifySource::new(dir.path().to_path_buf()).expect("watcher");

    assert_eq!(
        source.next_batch().await,
        vec![dir.path().join("request-early.json")]
    );
}

/// A denial interrupts the turn that asked for permission.
#[cfg(unix)]
#[tokio::test]
async fn denial_interrupts_the_owning_session() {
    use agent_bridge::bridge::{Bridge, SendOutcome};
    use agent_bridge::orchestrator::session::Session;

    use super::common::script_config;

    let dir = tempfile::tempdir().expect("tempdir");
    let script = r#"
cat > /dev/null
mkdir -p "$CLAUDE_PERMISSION_DIR"
printf '{"requestId":"p1","toolName":"Bash","inputs":{"command":"rm -rf /"},"channelId":"%s"}' "$CLAUDE_CHANNEL_ID" > "$CLAUDE_PERMISSION_DIR/request-p1.json"
echo "[PERMISSION_REQUEST]Tool: Bash"
exec sleep 30
"#;
    let mut config = script_config(dir.path(), script);
    config.permission.settle_millis = 0;
    config.permission.poll_interval_millis = 50;

    let bridge = Bridge::new(config.clone());
    let wake = Arc::new(Notify::new());
    let service = PermissionService::new(&config, Arc::new(FixedPrompt(PermissionDecision::Deny)));
    let cancel = CancellationToken::new();
    let source = PollingSource::new(config.permission_dir(), config.poll_interval(), Arc::clone(&wake));
    let service_task = service.spawn(Box::new(source), cancel.clone());

    let (session, _events) = Session::new(bridge.clone(), Arc::new(bridge.clone()), &config);
    let session = session.with_permission_wake(wake);
    let watcher = {
        let session = session.clone();
        let decisions = service.subscribe();
        tokio::spawn(async move { session.watch_permission_denials(decisions).await; })
    };

    let outcome = tokio::time::timeout(Duration::from_secs(10), session.send("clean up", Vec::new()))
        .await
        .expect("denial must end the turn");

    assert_eq!(outcome, SendOutcome::Interrupted);
    assert_eq!(
        read_response(&config.permission_dir(), "p1"),
        json!({"allow": false})
    );
    assert!(!session.state().await.busy);

    watcher.abort();
    cancel.cancel();
    service_task.await.expect("service task");
}
