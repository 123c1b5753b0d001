//! Alias tables for the many spellings upstream producers use for the same
//! concept. Each table is resolved first-non-null, in declaration order.

use serde_json::Value;

pub type FieldPath = &'static [&'static str];

pub const TOOL_CALL_TAGS: &[&str] = &[
    "toolCall",
    "toolUse",
    "tool_use",
    "tool_call",
    "functionCall",
    "function_call",
];

pub const TOOL_RESULT_TAGS: &[&str] = &["toolResult", "tool_result", "tool_result_multiple"];

/// Record-level roles that mark a persisted tool result rather than a turn.
pub const TOOL_RESULT_ROLES: &[&str] = &["toolResult", "tool_result", "tool"];

pub const TOOL_CALL_ID: &[FieldPath] = &[
    &["id"],
    &["toolUse", "id"],
    &["functionCall", "id"],
    &["toolCallId"],
    &["tool_call_id"],
];

pub const TOOL_CALL_NAME: &[FieldPath] = &[
    &["name"],
    &["toolUse", "name"],
    &["functionCall", "name"],
    &["function", "name"],
    &["toolName"],
    &["tool_name"],
];

pub const TOOL_CALL_ARGUMENTS: &[FieldPath] = &[
    &["arguments"],
    &["input"],
    &["args"],
    &["toolUse", "input"],
    &["functionCall", "arguments"],
    &["function", "arguments"],
];

pub const TOOL_RESULT_CALL_ID: &[FieldPath] = &[
    &["toolCallId"],
    &["tool_call_id"],
    &["tool_use_id"],
    &["toolUseId"],
    &["toolResult", "tool_use_id"],
    &["toolResult", "toolCallId"],
];

pub const TOOL_RESULT_NAME: &[FieldPath] = &[&["toolName"], &["tool_name"], &["name"]];

pub const TOOL_RESULT_CONTENT: &[FieldPath] = &[
    &["content"],
    &["toolResult", "content"],
    &["output"],
    &["result"],
];

pub const TOOL_RESULT_IS_ERROR: &[FieldPath] = &[
    &["isError"],
    &["is_error"],
    &["toolResult", "is_error"],
    &["toolResult", "isError"],
];

pub const RECORD_TOOL_CALLS: &[FieldPath] = &[&["toolCalls"], &["tool_calls"]];

pub const RECORD_TIMESTAMP: &[FieldPath] = &[&["createdAt"], &["created_at"], &["timestamp"]];

pub const USAGE_INPUT: &[FieldPath] = &[
    &["input"],
    &["inputTokens"],
    &["input_tokens"],
    &["prompt_tokens"],
    &["promptTokens"],
];

pub const USAGE_OUTPUT: &[FieldPath] = &[
    &["output"],
    &["outputTokens"],
    &["output_tokens"],
    &["completion_tokens"],
    &["completionTokens"],
];

pub const USAGE_TOTAL: &[FieldPath] = &[&["total"], &["totalTokens"], &["total_tokens"]];

pub fn lookup<'a>(value: &'a Value, path: FieldPath) -> Option<&'a Value> {
    path.iter()
        .try_fold(value, |node, key| node.get(key))
        .filter(|v| !v.is_null())
}

pub fn first_non_null<'a>(value: &'a Value, aliases: &[FieldPath]) -> Option<&'a Value> {
    aliases.iter().find_map(|path| lookup(value, path))
}

pub fn first_str(value: &Value, aliases: &[FieldPath]) -> Option<String> {
    aliases
        .iter()
        .find_map(|path| lookup(value, path).and_then(Value::as_str))
        .map(ToOwned::to_owned)
}

pub fn first_bool(value: &Value, aliases: &[FieldPath]) -> Option<bool> {
    aliases
        .iter()
        .find_map(|path| lookup(value, path).and_then(Value::as_bool))
}

/// Finite, non-negative numbers only; fractional counters are truncated.
pub fn first_count(value: &Value, aliases: &[FieldPath]) -> Option<u64> {
    aliases.iter().find_map(|path| {
        let v = lookup(value, path)?;
        v.as_u64().or_else(|| {
            v.as_f64()
                .filter(|f| f.is_finite() && *f >= 0.0)
                .map(|f| f as u64)
        })
    })
}

pub fn tag_in(part: &Value, tags: &[&str]) -> bool {
    part.get("type")
        .and_then(Value::as_str)
        .is_some_and(|t| tags.contains(&t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_path_lookup() {
        let v = json!({"toolUse": {"id": "abc"}});
        assert_eq!(lookup(&v, &["toolUse", "id"]), Some(&json!("abc")));
        assert!(lookup(&v, &["toolUse", "name"]).is_none());
    }

    #[test]
    fn null_is_skipped_for_next_alias() {
        let v = json!({"id": null, "toolUse": {"id": "nested"}});
        assert_eq!(first_str(&v, TOOL_CALL_ID).as_deref(), Some("nested"));
    }

    #[test]
    fn top_level_wins_over_nested() {
        let v = json!({"id": "top", "toolUse": {"id": "nested"}});
        assert_eq!(first_str(&v, TOOL_CALL_ID).as_deref(), Some("top"));
    }

    #[test]
    fn counts_reject_negative_and_non_numeric() {
        assert_eq!(first_count(&json!({"input": -1}), USAGE_INPUT), None);
        assert_eq!(first_count(&json!({"input": "12"}), USAGE_INPUT), None);
        assert_eq!(first_count(&json!({"inputTokens": 12.0}), USAGE_INPUT), Some(12));
    }
}
