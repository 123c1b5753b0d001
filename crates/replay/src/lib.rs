//! Deterministic, tick-driven re-reveal of a finished conversation.

use std::time::Duration;

use core_model::{Message, Role};
use serde::{Deserialize, Serialize};

mod driver;
mod sequencer;
pub mod words;

pub use driver::ReplayDriver;
pub use sequencer::{Cursor, Phase, ReplaySequencer};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionKind {
    /// One agent step; its title appears whole.
    Step,
    #[default]
    Summary,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    #[serde(default)]
    pub answered: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationStatus {
    Hidden,
    Waiting,
    Answered,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaySection {
    #[serde(default)]
    pub kind: SectionKind,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub details: Vec<String>,
    #[serde(default)]
    pub tool_calls: usize,
    #[serde(default)]
    pub confirmation: Option<Confirmation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayMessage {
    pub role: Role,
    #[serde(default)]
    pub sections: Vec<ReplaySection>,
}

impl From<&Message> for ReplayMessage {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role,
            sections: vec![ReplaySection {
                kind: SectionKind::Summary,
                text: message.content.clone(),
                details: Vec::new(),
                tool_calls: message.tool_calls.len(),
                confirmation: None,
            }],
        }
    }
}

/// Immutable input of one replay run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplaySnapshot {
    pub messages: Vec<ReplayMessage>,
}

impl ReplaySnapshot {
    pub fn from_messages(messages: &[Message]) -> Self {
        Self {
            messages: messages.iter().map(ReplayMessage::from).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RevealUnit {
    #[default]
    Chars,
    Words,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayConfig {
    pub tick: Duration,
    /// Units revealed per tick, in `unit`s.
    pub chars_per_tick: usize,
    pub unit: RevealUnit,
    /// Ticks a confirmation stays in the waiting state before it settles.
    pub confirmation_hold_ticks: usize,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(40),
            chars_per_tick: 1,
            unit: RevealUnit::Chars,
            confirmation_hold_ticks: 3,
        }
    }
}
