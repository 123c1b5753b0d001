//! Shapes exchanged with the transport and the history service.

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Lifecycle state of a generation event. Unrecognised states are treated as
/// deltas.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GenerationState {
    #[default]
    Delta,
    Final,
    Error,
}

impl<'de> Deserialize<'de> for GenerationState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(match raw.as_deref() {
            Some("final") => GenerationState::Final,
            Some("error") => GenerationState::Error,
            _ => GenerationState::Delta,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolPhase {
    Start,
    Update,
    Result,
    Other(String),
}

impl ToolPhase {
    pub fn as_str(&self) -> &str {
        match self {
            ToolPhase::Start => "start",
            ToolPhase::Update => "update",
            ToolPhase::Result => "result",
            ToolPhase::Other(raw) => raw,
        }
    }
}

impl Serialize for ToolPhase {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ToolPhase {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            "start" => ToolPhase::Start,
            "update" => ToolPhase::Update,
            "result" => ToolPhase::Result,
            _ => ToolPhase::Other(raw),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEventMessage {
    pub role: Option<String>,
    pub content: Option<Value>,
    pub timestamp: Option<Value>,
}

/// `chat` event: one delta/final/error tick of a generation run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEvent {
    pub session_key: Option<String>,
    pub run_id: Option<String>,
    pub turn_id: Option<String>,
    #[serde(default)]
    pub state: GenerationState,
    pub message: Option<ChatEventMessage>,
    pub usage: Option<Value>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolEventData {
    pub phase: Option<ToolPhase>,
    pub tool_call_id: Option<String>,
    pub name: Option<String>,
    pub args: Option<Value>,
    pub result: Option<Value>,
    pub meta: Option<String>,
    pub is_error: Option<bool>,
}

/// `agent` event. Only the `tool` stream is reconciled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEvent {
    pub session_key: Option<String>,
    pub run_id: Option<String>,
    pub turn_id: Option<String>,
    pub stream: Option<String>,
    pub data: Option<ToolEventData>,
}

/// Envelope the gateway wraps every pushed event in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayFrame {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub event: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRequest {
    pub session_key: String,
    pub limit: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    #[serde(default)]
    pub messages: Vec<Value>,
    pub total_messages: Option<u64>,
}

/// The history service. Implementations own transport, retries and timeouts.
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn fetch(&self, request: HistoryRequest) -> anyhow::Result<HistoryPage>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_event_decodes_camel_case() {
        let event: ChatEvent = serde_json::from_value(serde_json::json!({
            "sessionKey": "s1",
            "runId": "r1",
            "state": "final",
            "message": {"role": "assistant", "content": "hi", "timestamp": 1705312200000_i64},
            "errorMessage": null
        }))
        .unwrap();
        assert_eq!(event.session_key.as_deref(), Some("s1"));
        assert_eq!(event.state, GenerationState::Final);
        assert!(event.error_message.is_none());
    }

    #[test]
    fn unknown_generation_state_is_delta() {
        let event: ChatEvent =
            serde_json::from_value(serde_json::json!({"state": "aborted"})).unwrap();
        assert_eq!(event.state, GenerationState::Delta);
    }

    #[test]
    fn missing_state_defaults_to_delta() {
        let event: ChatEvent = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(event.state, GenerationState::Delta);
        let event: ChatEvent =
            serde_json::from_value(serde_json::json!({"state": null})).unwrap();
        assert_eq!(event.state, GenerationState::Delta);
    }

    #[test]
    fn tool_phase_keeps_unknown_values() {
        let data: ToolEventData =
            serde_json::from_value(serde_json::json!({"phase": "end"})).unwrap();
        assert_eq!(data.phase, Some(ToolPhase::Other("end".to_string())));
    }

    #[test]
    fn history_page_without_total() {
        let page: HistoryPage =
            serde_json::from_value(serde_json::json!({"messages": [{"role": "user"}]})).unwrap();
        assert_eq!(page.messages.len(), 1);
        assert!(page.total_messages.is_none());
    }

    #[test]
    fn gateway_frame_type_field() {
        let frame: GatewayFrame = serde_json::from_value(serde_json::json!({
            "type": "event",
            "event": "chat",
            "payload": {"sessionKey": "s"}
        }))
        .unwrap();
        assert_eq!(frame.kind.as_deref(), Some("event"));
        assert_eq!(frame.event.as_deref(), Some("chat"));
    }
}
