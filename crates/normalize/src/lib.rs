use chrono::{DateTime, TimeZone, Utc};
use core_model::{Message, Role, ToolCall, ToolCallStatus, ToolResult, Usage, deterministic_id};
use rayon::prelude::*;
use serde_json::Value;
use tracing::debug;

pub mod aliases;
mod text;

pub use text::{extract_text, strip_untrusted_metadata};

use aliases::{
    RECORD_TIMESTAMP, RECORD_TOOL_CALLS, TOOL_CALL_ARGUMENTS, TOOL_CALL_ID, TOOL_CALL_NAME,
    TOOL_CALL_TAGS, TOOL_RESULT_CALL_ID, TOOL_RESULT_CONTENT, TOOL_RESULT_IS_ERROR,
    TOOL_RESULT_NAME, TOOL_RESULT_ROLES, TOOL_RESULT_TAGS, USAGE_INPUT, USAGE_OUTPUT, USAGE_TOTAL,
};

pub const TOOL_CALL_PLACEHOLDER: &str = "[tool call]";
pub const NO_TEXT_PLACEHOLDER: &str = "[no text content]";
pub const TOOL_RESULT_PLACEHOLDER: &str = "[tool result]";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedPart {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<ToolResult>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedContent {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<ToolResult>,
}

/// What one persisted record turns into before history is folded together.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedRecord {
    Message(Message),
    /// Results that belong to the assistant turn preceding this record.
    ToolResults {
        id: String,
        timestamp: DateTime<Utc>,
        results: Vec<ToolResult>,
    },
}

pub fn normalize_content_part(part: &Value) -> NormalizedPart {
    let mut out = NormalizedPart {
        text: part
            .get("text")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(ToOwned::to_owned),
        ..Default::default()
    };
    if aliases::tag_in(part, TOOL_CALL_TAGS) {
        out.tool_calls.push(tool_call_from(part));
    } else if aliases::tag_in(part, TOOL_RESULT_TAGS) {
        out.tool_results.push(tool_result_from(part));
    }
    out
}

pub fn normalize_content(content: Option<&Value>) -> NormalizedContent {
    let mut out = NormalizedContent::default();
    match content {
        Some(Value::String(s)) => {
            out.text = strip_untrusted_metadata(s).into_owned();
        }
        Some(Value::Array(parts)) => {
            let mut texts = Vec::new();
            for part in parts {
                let normalized = normalize_content_part(part);
                texts.extend(normalized.text);
                out.tool_calls.extend(normalized.tool_calls);
                out.tool_results.extend(normalized.tool_results);
            }
            out.text = strip_untrusted_metadata(&texts.join("\n")).into_owned();
        }
        _ => {}
    }
    out
}

/// `None` means "no usage reported", which is distinct from all-zero usage.
pub fn normalize_usage(usage: Option<&Value>) -> Option<Usage> {
    let usage = usage.filter(|v| v.is_object())?;
    let normalized = Usage {
        input: aliases::first_count(usage, USAGE_INPUT),
        output: aliases::first_count(usage, USAGE_OUTPUT),
        total: aliases::first_count(usage, USAGE_TOTAL),
    };
    if normalized == Usage::default() {
        return None;
    }
    Some(normalized)
}

/// Epoch milliseconds or an RFC 3339 string.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    if let Some(ms) = value.as_i64() {
        return Utc.timestamp_millis_opt(ms).single();
    }
    if let Some(ms) = value.as_f64().filter(|f| f.is_finite()) {
        return Utc.timestamp_millis_opt(ms as i64).single();
    }
    let s = value.as_str()?;
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub fn extract_ts(record: &Value) -> Option<DateTime<Utc>> {
    aliases::first_non_null(record, RECORD_TIMESTAMP).and_then(parse_timestamp)
}

pub fn history_message_id(session_key: &str, index: usize, raw: &Value) -> String {
    let digest = deterministic_id(&[session_key, &raw.to_string()]);
    format!("history-{index}-{}", &digest[..12])
}

pub fn normalize_record(session_key: &str, index: usize, raw: &Value) -> NormalizedRecord {
    let id = history_message_id(session_key, index, raw);
    let timestamp = extract_ts(raw).unwrap_or_else(Utc::now);
    let role = raw.get("role").and_then(Value::as_str);

    if role.is_some_and(|r| TOOL_RESULT_ROLES.contains(&r)) {
        let result = ToolResult {
            tool_call_id: aliases::first_str(raw, TOOL_RESULT_CALL_ID),
            tool_name: aliases::first_str(raw, TOOL_RESULT_NAME),
            content: Some(extract_text(raw.get("content"))),
            is_error: aliases::first_bool(raw, TOOL_RESULT_IS_ERROR),
            duration_ms: None,
        };
        return NormalizedRecord::ToolResults {
            id,
            timestamp,
            results: vec![result],
        };
    }

    let mut content = normalize_content(raw.get("content"));
    if let Some(calls) = aliases::first_non_null(raw, RECORD_TOOL_CALLS).and_then(Value::as_array)
    {
        content
            .tool_calls
            .extend(calls.iter().filter(|c| c.is_object()).map(tool_call_from));
    }

    let role = Role::coerce(role);
    // A user turn carrying nothing but tool results is the provider echoing
    // results back; it belongs to the preceding assistant turn.
    if role == Role::User
        && content.text.is_empty()
        && content.tool_calls.is_empty()
        && !content.tool_results.is_empty()
    {
        return NormalizedRecord::ToolResults {
            id,
            timestamp,
            results: content.tool_results,
        };
    }

    let text = if !content.text.is_empty() {
        content.text
    } else if !content.tool_calls.is_empty() {
        TOOL_CALL_PLACEHOLDER.to_string()
    } else {
        NO_TEXT_PLACEHOLDER.to_string()
    };
    let mut message = Message::new(id, role, text, timestamp);
    message.usage = normalize_usage(raw.get("usage"));
    message.tool_calls = content.tool_calls;
    message.tool_results = content.tool_results;
    NormalizedRecord::Message(message)
}

/// Normalizes a conversation's persisted records, in order. Tool-result
/// records are folded into the assistant turn right before them; a result with
/// no assistant turn before it becomes a standalone assistant turn so it is
/// not lost.
pub fn normalize_history(session_key: &str, records: &[Value]) -> Vec<Message> {
    let normalized: Vec<NormalizedRecord> = records
        .par_iter()
        .enumerate()
        .map(|(index, raw)| normalize_record(session_key, index, raw))
        .collect();

    let mut out: Vec<Message> = Vec::with_capacity(normalized.len());
    for record in normalized {
        match record {
            NormalizedRecord::Message(message) => out.push(message),
            NormalizedRecord::ToolResults {
                id,
                timestamp,
                results,
            } => match out.last_mut() {
                Some(last) if last.role == Role::Assistant => {
                    last.tool_results.extend(results);
                }
                _ => {
                    debug!(session_key, id = %id, "orphaned tool result in history");
                    let mut orphan =
                        Message::new(id, Role::Assistant, TOOL_RESULT_PLACEHOLDER, timestamp);
                    orphan.tool_results = results;
                    out.push(orphan);
                }
            },
        }
    }
    out
}

fn tool_call_from(part: &Value) -> ToolCall {
    ToolCall {
        id: aliases::first_str(part, TOOL_CALL_ID),
        name: aliases::first_str(part, TOOL_CALL_NAME),
        arguments: aliases::first_non_null(part, TOOL_CALL_ARGUMENTS).cloned(),
        status: ToolCallStatus::Done,
        duration_ms: None,
    }
}

fn tool_result_from(part: &Value) -> ToolResult {
    let content = aliases::first_non_null(part, TOOL_RESULT_CONTENT).map(|v| match v {
        Value::String(s) => s.clone(),
        Value::Array(_) => extract_text(Some(v)),
        other => other.to_string(),
    });
    ToolResult {
        tool_call_id: aliases::first_str(part, TOOL_RESULT_CALL_ID),
        tool_name: aliases::first_str(part, TOOL_RESULT_NAME),
        content,
        is_error: aliases::first_bool(part, TOOL_RESULT_IS_ERROR),
        duration_ms: None,
    }
}
