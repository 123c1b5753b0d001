use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

mod wire;

pub use wire::{
    AgentEvent, ChatEvent, ChatEventMessage, GatewayFrame, GenerationState, HistoryPage,
    HistoryRequest, HistorySource, ToolEventData, ToolPhase,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    /// Anything that is not literally `user` is rendered as an assistant turn.
    pub fn coerce(raw: Option<&str>) -> Self {
        match raw {
            Some("user") => Role::User,
            _ => Role::Assistant,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            _ => anyhow::bail!("unknown role: {s}"),
        }
    }
}

/// Client-local send lifecycle marker. Never part of server history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sending,
    Failed,
    Waiting,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    Running,
    #[default]
    Done,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
}

impl Usage {
    /// Field-wise saturating sum; a side that did not report a counter
    /// contributes zero.
    pub fn accumulate(&self, next: &Usage) -> Usage {
        Usage {
            input: Some(self.input.unwrap_or(0).saturating_add(next.input.unwrap_or(0))),
            output: Some(self.output.unwrap_or(0).saturating_add(next.output.unwrap_or(0))),
            total: Some(self.total.unwrap_or(0).saturating_add(next.total.unwrap_or(0))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    pub status: ToolCallStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPayload {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_payload: Option<RetryPayload>,
}

impl Message {
    pub fn new(
        id: impl Into<String>,
        role: Role,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            role,
            content: content.into(),
            timestamp,
            usage: None,
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            status: None,
            retry_payload: None,
        }
    }
}

/// One assistant generation cycle within a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunKey {
    pub session_key: String,
    pub run_id: String,
}

impl RunKey {
    pub fn new(session_key: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            session_key: session_key.into(),
            run_id: run_id.into(),
        }
    }

    pub fn message_id(&self) -> String {
        assistant_message_id(&self.session_key, &self.run_id)
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.session_key, self.run_id)
    }
}

pub fn assistant_message_id(session_key: &str, group_id: &str) -> String {
    format!("assistant-{session_key}:{group_id}")
}

/// Records that converge by identity rather than by position.
pub trait Keyed: Clone {
    /// Prefix of the positional key given to records without an identity.
    const FALLBACK_PREFIX: &'static str;

    fn identity(&self) -> Option<&str>;

    /// Shallow overlay: every field the incoming record carries wins.
    fn overlay(&mut self, incoming: &Self);
}

impl Keyed for ToolCall {
    const FALLBACK_PREFIX: &'static str = "call";

    fn identity(&self) -> Option<&str> {
        self.id.as_deref().or(self.name.as_deref())
    }

    fn overlay(&mut self, incoming: &Self) {
        overlay_field(&mut self.id, &incoming.id);
        overlay_field(&mut self.name, &incoming.name);
        overlay_field(&mut self.arguments, &incoming.arguments);
        overlay_field(&mut self.duration_ms, &incoming.duration_ms);
        self.status = incoming.status;
    }
}

impl Keyed for ToolResult {
    const FALLBACK_PREFIX: &'static str = "result";

    fn identity(&self) -> Option<&str> {
        self.tool_call_id.as_deref().or(self.tool_name.as_deref())
    }

    fn overlay(&mut self, incoming: &Self) {
        overlay_field(&mut self.tool_call_id, &incoming.tool_call_id);
        overlay_field(&mut self.tool_name, &incoming.tool_name);
        overlay_field(&mut self.content, &incoming.content);
        overlay_field(&mut self.is_error, &incoming.is_error);
        overlay_field(&mut self.duration_ms, &incoming.duration_ms);
    }
}

fn overlay_field<T: Clone>(slot: &mut Option<T>, incoming: &Option<T>) {
    if let Some(value) = incoming {
        *slot = Some(value.clone());
    }
}

/// Merges `incoming` onto `existing`, keeping first-seen key order.
pub fn merge_by_key<T: Keyed>(existing: &[T], incoming: &[T]) -> Vec<T> {
    let mut out: Vec<T> = Vec::with_capacity(existing.len() + incoming.len());
    let mut positions: HashMap<String, usize> = HashMap::new();
    for item in existing.iter().chain(incoming) {
        let key = item
            .identity()
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| format!("{}-{}", T::FALLBACK_PREFIX, positions.len()));
        match positions.get(&key) {
            Some(&pos) => out[pos].overlay(item),
            None => {
                positions.insert(key, out.len());
                out.push(item.clone());
            }
        }
    }
    out
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub fn deterministic_id(parts: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(&[0x1f]);
    }
    hasher.finalize().to_hex().to_string()
}
