use core_model::{ToolCall, ToolResult, merge_by_key};
use serde_json::Value;

/// Tool state for one run (or turn) that is kept whether or not its
/// assistant message exists yet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolAccumulator {
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<ToolResult>,
}

impl ToolAccumulator {
    pub fn is_empty(&self) -> bool {
        self.tool_calls.is_empty() && self.tool_results.is_empty()
    }

    pub fn merge(&mut self, calls: &[ToolCall], results: &[ToolResult]) {
        if !calls.is_empty() {
            self.tool_calls = merge_by_key(&self.tool_calls, calls);
        }
        if !results.is_empty() {
            self.tool_results = merge_by_key(&self.tool_results, results);
        }
    }
}

/// Renders a raw tool result for display. Strings pass through; anything else
/// is pretty-printed JSON. A non-empty `meta` goes on its own first line.
pub fn format_tool_result(result: Option<&Value>, meta: Option<&str>) -> String {
    let base = match result {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    };
    match meta.filter(|m| !m.is_empty()) {
        Some(meta) if !base.is_empty() => format!("{meta}\n{base}"),
        Some(meta) => meta.to_string(),
        None => base,
    }
}
