use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use core_model::{HistoryPage, HistoryRequest, HistorySource};
use serde_json::Value;
use tracing::debug;

/// Serves one conversation's raw records from a JSON file, newest `limit`
/// first-to-last, the way the history service pages them.
pub struct FileHistorySource {
    session_key: String,
    records: Vec<Value>,
}

impl FileHistorySource {
    pub fn new(session_key: impl Into<String>, records: Vec<Value>) -> Self {
        Self {
            session_key: session_key.into(),
            records,
        }
    }

    /// Accepts a bare array of records or a `{"messages": [...]}` page.
    pub fn from_value(session_key: impl Into<String>, value: Value) -> anyhow::Result<Self> {
        let records = match value {
            Value::Array(records) => records,
            Value::Object(mut page) => match page.remove("messages") {
                Some(Value::Array(records)) => records,
                _ => anyhow::bail!("history object has no \"messages\" array"),
            },
            _ => anyhow::bail!("history must be an array or an object with \"messages\""),
        };
        Ok(Self::new(session_key, records))
    }

    pub fn open(session_key: impl Into<String>, path: &Path) -> anyhow::Result<Self> {
        let value = read_json(path)?;
        Self::from_value(session_key, value)
            .with_context(|| format!("reading history from {}", path.display()))
    }
}

#[async_trait]
impl HistorySource for FileHistorySource {
    async fn fetch(&self, request: HistoryRequest) -> anyhow::Result<HistoryPage> {
        if request.session_key != self.session_key {
            debug!(session_key = %request.session_key, "no history for session");
            return Ok(HistoryPage {
                messages: Vec::new(),
                total_messages: Some(0),
            });
        }
        let start = self.records.len().saturating_sub(request.limit);
        Ok(HistoryPage {
            messages: self.records[start..].to_vec(),
            total_messages: Some(self.records.len() as u64),
        })
    }
}

pub fn read_json(path: &Path) -> anyhow::Result<Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("invalid JSON in {}", path.display()))
}
