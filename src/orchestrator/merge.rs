//! Streaming assistant-payload merge.
//!
//! The agent re-sends the full-so-far assistant payload on every chunk, and
//! sometimes only part of it. Merging rules:
//!
//! 1. Top-level fields of the incoming payload overwrite the accumulated
//!    ones (latest wins), except `message`.
//! 2. Fields of `message` overwrite likewise, except `content`.
//! 3. `content` arrays merge by block key: `id`, or `tool_result:` plus
//!    `tool_use_id`. A known key replaces its block in place, a new key is
//!    appended, and a block without a key is always appended. A chunk whose
//!    `content` is not an array leaves an accumulated array untouched.
//!
//! A keyed block delivered once is never lost or duplicated by later chunks.

use serde_json::Value;

use crate::{AppError, Result};

/// Key prefix for tool-result blocks, which carry `tool_use_id` and no `id`.
pub const TOOL_RESULT_KEY_PREFIX: &str = "tool_result:";

/// Merge `incoming` into `existing`.
///
/// With no existing payload the incoming one is returned as-is.
///
/// # Errors
///
/// Returns `AppError::Stream` if `incoming` is not a JSON object. The
/// caller keeps its previous payload in that case.
pub fn merge_assistant_message(existing: Option<&Value>, incoming: &Value) -> Result<Value> {
    let Some(incoming_obj) = incoming.as_object() else {
        return Err(AppError::Stream("assistant payload is not a json object".into()));
    };
    let Some(existing_obj) = existing.and_then(Value::as_object) else {
        return Ok(incoming.clone());
    };

    let mut merged = existing_obj.clone();
    for (key, value) in incoming_obj {
        if key != "message" {
            merged.insert(key.clone(), value.clone());
        }
    }

    let Some(incoming_message) = incoming_obj.get("message").and_then(Value::as_object) else {
        return Ok(Value::Object(merged));
    };

    let mut message = existing_obj
        .get("message")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    for (key, value) in incoming_message {
        if key != "content" {
            message.insert(key.clone(), value.clone());
        }
    }

    if let Some(incoming_content) = incoming_message.get("content") {
        let content = merge_content(message.get("content"), incoming_content);
        message.insert("content".into(), content);
    }

    merged.insert("message".into(), Value::Object(message));
    Ok(Value::Object(merged))
}

/// Merge two `content` values.
///
/// A non-array `incoming` never replaces an accumulated array, so keyed
/// blocks survive a text-only chunk. A non-array accumulated value is
/// treated as empty.
fn merge_content(existing: Option<&Value>, incoming: &Value) -> Value {
    let existing = existing.and_then(Value::as_array);
    let Some(incoming_blocks) = incoming.as_array() else {
        return existing.map_or_else(|| incoming.clone(), |blocks| Value::Array(blocks.clone()));
    };

    let mut merged = existing.cloned().unwrap_or_default();
    for block in incoming_blocks {
        let position = content_block_key(block).and_then(|key| {
            merged
                .iter()
                .position(|b| content_block_key(b).as_deref() == Some(key.as_str()))
        });
        match position {
            Some(idx) => merged[idx] = block.clone(),
            None => merged.push(block.clone()),
        }
    }

    Value::Array(merged)
}

/// Stable key of a content block, if it has one.
#[must_use]
pub fn content_block_key(block: &Value) -> Option<String> {
    let obj = block.as_object()?;
    match obj.get("id") {
        Some(Value::String(id)) if !id.is_empty() => return Some(id.clone()),
        Some(Value::Number(id)) => return Some(id.to_string()),
        _ => {}
    }
    obj.get("tool_use_id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(|id| format!("{TOOL_RESULT_KEY_PREFIX}{id}"))
}

/// Display text of an agent message payload.
///
/// `message.content` is either a string, or an array of blocks rendered as:
/// text blocks verbatim, `tool_use` as `[tool: <name>]`, thinking as
/// `[thinking]`; rendered blocks are joined with newlines.
#[must_use]
pub fn extract_message_text(payload: &Value) -> String {
    let Some(content) = payload.get("message").and_then(|m| m.get("content")) else {
        return String::new();
    };

    match content {
        Value::String(text) => text.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(render_block)
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn render_block(block: &Value) -> Option<String> {
    let block = block.as_object()?;
    match block.get("type").and_then(Value::as_str)? {
        "text" => block.get("text").and_then(Value::as_str).map(str::to_owned),
        "tool_use" => block
            .get("name")
            .and_then(Value::as_str)
            .map(|name| format!("[tool: {name}]")),
        "thinking" => block
            .get("thinking")
            .filter(|t| !t.is_null())
            .map(|_| "[thinking]".to_owned()),
        _ => None,
    }
}

/// Whether `payload` carries a non-empty `message.content`.
#[must_use]
pub fn has_content(payload: &Value) -> bool {
    match payload.get("message").and_then(|m| m.get("content")) {
        Some(Value::String(text)) => !text.is_empty(),
        Some(Value::Array(blocks)) => !blocks.is_empty(),
        _ => false,
    }
}

