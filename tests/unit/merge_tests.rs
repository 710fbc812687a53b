//! Unit tests for the streaming assistant-message merge.

use serde_json::{json, Value};

use agent_bridge::orchestrator::merge::{
    content_block_key, extract_message_text, has_content, merge_assistant_message,
};
use agent_bridge::AppError;

fn assistant(content: Value) -> Value {
    json!({"type": "assistant", "message": {"role": "assistant", "content": content}})
}

fn content(payload: &Value) -> &Vec<Value> {
    payload["message"]["content"]
        .as_array()
        .expect("content array")
}

#[test]
fn first_payload_is_taken_as_is() {
    let incoming = assistant(json!([{"type": "text", "text": "hi"}]));
    let merged = merge_assistant_message(None, &incoming).expect("merge");
    assert_eq!(merged, incoming);
}

#[test]
fn non_object_payload_is_rejected() {
    let err = merge_assistant_message(None, &json!("nope")).expect_err("must fail");
    assert!(matches!(err, AppError::Stream(_)));
}

/// Replaying the same payload must not duplicate keyed blocks.
#[test]
fn merge_is_idempotent() {
    let payload = assistant(json!([
        {"type": "tool_use", "id": "tu_1", "name": "Bash", "input": {}},
        {"type": "tool_result", "tool_use_id": "tu_1", "content": "ok"},
    ]));

    let once = merge_assistant_message(None, &payload).expect("merge");
    let twice = merge_assistant_message(Some(&once), &payload).expect("merge");

    assert_eq!(content(&once), content(&twice));
    assert_eq!(content(&twice).len(), 2);
}

/// A text-only chunk after tool blocks keeps the accumulated array.
#[test]
fn string_content_keeps_accumulated_blocks() {
    let tools = assistant(json!([
        {"type": "tool_use", "id": "tu_1", "name": "Bash", "input": {}},
        {"type": "tool_result", "tool_use_id": "tu_1", "content": "ok"},
    ]));
    let base = merge_assistant_message(None, &tools).expect("merge");

    let merged =
        merge_assistant_message(Some(&base), &assistant(json!("final text"))).expect("merge");

    assert_eq!(content(&merged), content(&base));
}

/// Keys repeated inside one chunk collapse when the accumulated content is
/// not an array.
#[test]
fn non_array_base_is_merged_as_empty() {
    let base = assistant(json!("thinking..."));
    let incoming = assistant(json!([
        {"type": "tool_use", "id": "tu_1", "name": "Bash", "input": {"v": 1}},
        {"type": "tool_use", "id": "tu_1", "name": "Bash", "input": {"v": 2}},
        {"type": "text", "text": "done"},
    ]));

    let merged = merge_assistant_message(Some(&base), &incoming).expect("merge");

    let blocks = content(&merged);
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0]["input"]["v"], 2);
    assert_eq!(blocks[1]["text"], "done");
}

/// Two string contents simply take the latest.
#[test]
fn string_content_replaces_string_content() {
    let base = assistant(json!("draft"));
    let merged = merge_assistant_message(Some(&base), &assistant(json!("final"))).expect("merge");
    assert_eq!(merged["message"]["content"], "final");
}

/// Growing payloads end with one block per distinct key, each holding its
/// latest delivery.
#[test]
fn merge_is_monotonic_over_growing_payloads() {
    let p1 = assistant(json!([
        {"type": "tool_use", "id": "a", "name": "Read", "input": {"v": 1}},
    ]));
    let p2 = assistant(json!([
        {"type": "tool_use", "id": "a", "name": "Read", "input": {"v": 2}},
        {"type": "tool_result", "tool_use_id": "a", "content": "partial"},
    ]));
    let p3 = assistant(json!([
        {"type": "tool_use", "id": "a", "name": "Read", "input": {"v": 2}},
        {"type": "tool_result", "tool_use_id": "a", "content": "done"},
        {"type": "tool_use", "id": "b", "name": "Bash", "input": {}},
    ]));

    let mut merged = None;
    for payload in [&p1, &p2, &p3] {
        merged = Some(merge_assistant_message(merged.as_ref(), payload).expect("merge"));
    }
    let merged = merged.expect("merged");
    let blocks = content(&merged);

    assert_eq!(blocks.len(), 3);
    assert_eq!(blocks[0]["input"]["v"], 2);
    assert_eq!(blocks[1]["content"], "done");
    assert_eq!(blocks[2]["id"], "b");
}

/// A chunk that carries only the newest block keeps the earlier ones.
#[test]
fn partial_resend_keeps_earlier_blocks() {
    let first = assistant(json!([{"type": "tool_use", "id": "a", "name": "Read", "input": {}}]));
    let second = assistant(json!([{"type": "tool_use", "id": "b", "name": "Bash", "input": {}}]));

    let merged = merge_assistant_message(None, &first).expect("merge");
    let merged = merge_assistant_message(Some(&merged), &second).expect("merge");

    let ids: Vec<_> = content(&merged).iter().map(|b| b["id"].clone()).collect();
    assert_eq!(ids, vec![json!("a"), json!("b")]);
}

#[test]
fn unkeyed_blocks_always_append() {
    let payload = assistant(json!([{"type": "text", "text": "hi"}]));
    let merged = merge_assistant_message(None, &payload).expect("merge");
    let merged = merge_assistant_message(Some(&merged), &payload).expect("merge");
    assert_eq!(content(&merged).len(), 2);
}

#[test]
fn top_level_and_message_fields_take_latest() {
    let first = json!({
        "type": "assistant",
        "uuid": "u1",
        "message": {"id": "m1", "stop_reason": null, "content": []},
    });
    let second = json!({
        "type": "assistant",
        "uuid": "u2",
        "message": {"stop_reason": "end_turn", "content": []},
    });

    let merged = merge_assistant_message(Some(&first), &second).expect("merge");

    assert_eq!(merged["uuid"], "u2");
    assert_eq!(merged["message"]["id"], "m1");
    assert_eq!(merged["message"]["stop_reason"], "end_turn");
}

#[test]
fn block_keys() {
    assert_eq!(content_block_key(&json!({"id": "x"})).as_deref(), Some("x"));
    assert_eq!(content_block_key(&json!({"id": 7})).as_deref(), Some("7"));
    assert_eq!(
        content_block_key(&json!({"tool_use_id": "t"})).as_deref(),
        Some("tool_result:t")
    );
    assert_eq!(content_block_key(&json!({"type": "text"})), None);
    assert_eq!(content_block_key(&json!({"id": ""})), None);
}

#[test]
fn text_extraction_renders_blocks() {
    let payload = assistant(json!([
        {"type": "thinking", "thinking": "pondering"},
        {"type": "text", "text": "Looking."},
        {"type": "tool_use", "id": "a", "name": "Read", "input": {}},
        {"type": "tool_result", "tool_use_id": "a", "content": "x"},
    ]));

    assert_eq!(
        extract_message_text(&payload),
        "[thinking]\nLooking.\n[tool: Read]"
    );
    assert!(has_content(&payload));
}

#[test]
fn text_extraction_accepts_string_content() {
    let payload = json!({"type": "user", "message": {"content": "hello"}});
    assert_eq!(extract_message_text(&payload), "hello");
    assert!(!has_content(&json!({"message": {"content": ""}})));
    assert_eq!(extract_message_text(&json!({"type": "system"})), "");
}
