//! Folds live `chat` and `agent` events into the conversation store.
//!
//! Every event is handled in isolation: malformed or irrelevant input is
//! logged and skipped, never surfaced as an error.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use conversation_store::{SharedStore, lock};
use core_model::{
    AgentEvent, ChatEvent, Clock, GatewayFrame, GenerationState, Message, MessageStatus, Role,
    RunKey, SystemClock, ToolCall, ToolCallStatus, ToolPhase, ToolResult, Usage, merge_by_key,
};
use normalize::{extract_text, normalize_usage, parse_timestamp};
use tracing::{debug, warn};

pub mod outbox;
mod tools;

pub use tools::{ToolAccumulator, format_tool_result};

pub const GENERIC_ERROR_TEXT: &str = "Request failed, please retry";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatOutcome {
    Ignored,
    Inserted(String),
    Updated(String),
    /// Empty final for an existing message; the message is left as it was.
    Kept(String),
    /// Empty final with no message to anchor it to.
    Dropped,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutcome {
    Ignored,
    /// Recorded for the run; no assistant message exists yet.
    Accumulated,
    Attached(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    Chat(ChatOutcome),
    Tool(ToolOutcome),
    Malformed,
    Ignored,
}

/// Key of the assistant message and tool state an event belongs to: the turn
/// when the event names one, otherwise the run.
pub fn group_key(session_key: &str, run_id: &str, turn_id: Option<&str>) -> RunKey {
    let group = turn_id.filter(|t| !t.trim().is_empty()).unwrap_or(run_id);
    RunKey::new(session_key, group)
}

pub fn error_text(error_message: Option<&str>) -> String {
    match error_message.map(str::trim).filter(|m| !m.is_empty()) {
        Some(message) => format!("Request failed: {message}"),
        None => GENERIC_ERROR_TEXT.to_string(),
    }
}

pub struct LiveReconciler<C = SystemClock> {
    clock: C,
    tools: HashMap<RunKey, ToolAccumulator>,
    tool_started: HashMap<(RunKey, String), DateTime<Utc>>,
    usage_applied: HashSet<RunKey>,
}

impl Default for LiveReconciler<SystemClock> {
    fn default() -> Self {
        Self::new(SystemClock)
    }
}

impl<C: Clock> LiveReconciler<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            tools: HashMap::new(),
            tool_started: HashMap::new(),
            usage_applied: HashSet::new(),
        }
    }

    pub fn pending_tools(&self, group: &RunKey) -> Option<&ToolAccumulator> {
        self.tools.get(group)
    }

    pub fn usage_applied(&self, run: &RunKey) -> bool {
        self.usage_applied.contains(run)
    }

    /// Drops all tool state for a group, including start times of tools whose
    /// result never arrived.
    pub fn forget_run(&mut self, group: &RunKey) {
        self.tools.remove(group);
        self.tool_started.retain(|(key, _), _| key != group);
    }

    pub fn apply_frame(&mut self, store: &SharedStore, frame: &GatewayFrame) -> FrameOutcome {
        if frame.kind.as_deref().is_some_and(|kind| kind != "event") {
            debug!(kind = ?frame.kind, "ignoring non-event frame");
            return FrameOutcome::Ignored;
        }
        match frame.event.as_deref() {
            Some("chat") => match serde_json::from_value::<ChatEvent>(frame.payload.clone()) {
                Ok(event) => FrameOutcome::Chat(self.apply_chat(store, &event)),
                Err(err) => {
                    warn!(error = %err, "undecodable chat payload");
                    FrameOutcome::Malformed
                }
            },
            Some("agent") => match serde_json::from_value::<AgentEvent>(frame.payload.clone()) {
                Ok(event) => FrameOutcome::Tool(self.apply_agent(store, &event)),
                Err(err) => {
                    warn!(error = %err, "undecodable agent payload");
                    FrameOutcome::Malformed
                }
            },
            other => {
                debug!(event = ?other, "ignoring gateway event");
                FrameOutcome::Ignored
            }
        }
    }

    pub fn apply_chat(&mut self, store: &SharedStore, event: &ChatEvent) -> ChatOutcome {
        let (Some(session_key), Some(run_id)) = (
            non_blank(event.session_key.as_deref()),
            non_blank(event.run_id.as_deref()),
        ) else {
            debug!("chat event without session or run");
            return ChatOutcome::Ignored;
        };
        let message = event.message.as_ref();
        if message.and_then(|m| m.role.as_deref()) == Some("user") {
            debug!(session_key, run_id, "ignoring echoed user message");
            return ChatOutcome::Ignored;
        }

        let run = RunKey::new(session_key, run_id);
        let group = group_key(session_key, run_id, event.turn_id.as_deref());
        let message_id = group.message_id();

        if event.state == GenerationState::Error {
            let text = error_text(event.error_message.as_deref());
            let mut store = lock(store);
            let existing = store.find(session_key, &message_id);
            let mut failed = Message::new(&message_id, Role::Assistant, text, self.clock.now());
            failed.usage = existing.and_then(|m| m.usage);
            let (calls, results) = existing
                .map(|m| (m.tool_calls.as_slice(), m.tool_results.as_slice()))
                .unwrap_or_default();
            let acc = self.tools.get(&group).cloned().unwrap_or_default();
            failed.tool_calls = merge_by_key(calls, &acc.tool_calls);
            failed.tool_results = merge_by_key(results, &acc.tool_results);
            store.upsert(session_key, failed);
            drop(store);

            warn!(session_key, run_id, error = ?event.error_message, "generation failed");
            self.finish(&run, &group);
            return ChatOutcome::Failed(message_id);
        }

        let text = extract_text(message.and_then(|m| m.content.as_ref()));
        let is_final = event.state == GenerationState::Final;
        let mut guard = lock(store);

        if text.is_empty() && is_final {
            let exists = guard.contains(session_key, &message_id);
            drop(guard);
            self.finish(&run, &group);
            return if exists {
                ChatOutcome::Kept(message_id)
            } else {
                debug!(session_key, run_id, "dropping empty final without a message");
                ChatOutcome::Dropped
            };
        }

        let timestamp = message
            .and_then(|m| m.timestamp.as_ref())
            .and_then(parse_timestamp)
            .unwrap_or_else(|| self.clock.now());
        let usage = normalize_usage(event.usage.as_ref());
        let acc = self.tools.get(&group);

        let outcome = match guard.find_mut(session_key, &message_id) {
            Some(existing) => {
                if !text.is_empty() {
                    existing.content = text;
                    if existing.status == Some(MessageStatus::Waiting) {
                        existing.status = None;
                    }
                }
                existing.timestamp = timestamp;
                existing.usage =
                    accumulate_usage(&mut self.usage_applied, existing.usage, usage, &run);
                if let Some(acc) = acc {
                    existing.tool_calls = merge_by_key(&existing.tool_calls, &acc.tool_calls);
                    existing.tool_results =
                        merge_by_key(&existing.tool_results, &acc.tool_results);
                }
                ChatOutcome::Updated(message_id)
            }
            None => {
                let mut fresh = Message::new(&message_id, Role::Assistant, text, timestamp);
                fresh.usage = accumulate_usage(&mut self.usage_applied, None, usage, &run);
                if let Some(acc) = acc {
                    fresh.tool_calls = acc.tool_calls.clone();
                    fresh.tool_results = acc.tool_results.clone();
                }
                guard.append(session_key, fresh);
                ChatOutcome::Inserted(message_id)
            }
        };
        drop(guard);

        if is_final {
            self.finish(&run, &group);
        }
        outcome
    }

    pub fn apply_agent(&mut self, store: &SharedStore, event: &AgentEvent) -> ToolOutcome {
        if event.stream.as_deref() != Some("tool") {
            return ToolOutcome::Ignored;
        }
        let (Some(session_key), Some(run_id), Some(data)) = (
            non_blank(event.session_key.as_deref()),
            non_blank(event.run_id.as_deref()),
            event.data.as_ref(),
        ) else {
            debug!("tool event without session, run or data");
            return ToolOutcome::Ignored;
        };

        let group = group_key(session_key, run_id, event.turn_id.as_deref());
        let call_id = non_blank(data.tool_call_id.as_deref());
        let now = self.clock.now();

        let (calls, results) = match &data.phase {
            Some(phase @ (ToolPhase::Start | ToolPhase::Update)) => {
                if *phase == ToolPhase::Start
                    && let Some(id) = call_id
                {
                    self.tool_started.insert((group.clone(), id.to_string()), now);
                }
                let running = ToolCall {
                    id: call_id.map(ToOwned::to_owned),
                    name: data.name.clone(),
                    arguments: data.args.clone(),
                    status: ToolCallStatus::Running,
                    duration_ms: None,
                };
                (vec![running], Vec::new())
            }
            Some(ToolPhase::Result) => {
                let duration_ms = call_id
                    .and_then(|id| self.tool_started.remove(&(group.clone(), id.to_string())))
                    .map(|started| (now - started).num_milliseconds().max(0) as u64);
                let done = ToolCall {
                    id: call_id.map(ToOwned::to_owned),
                    name: data.name.clone(),
                    arguments: None,
                    status: ToolCallStatus::Done,
                    duration_ms,
                };
                let result = ToolResult {
                    tool_call_id: call_id.map(ToOwned::to_owned),
                    tool_name: data.name.clone(),
                    content: Some(format_tool_result(data.result.as_ref(), data.meta.as_deref())),
                    is_error: Some(data.is_error.unwrap_or(false)),
                    duration_ms,
                };
                (vec![done], vec![result])
            }
            other => {
                debug!(session_key, run_id, phase = ?other, "ignoring tool phase");
                return ToolOutcome::Ignored;
            }
        };

        let message_id = group.message_id();
        let attached = lock(store).update(session_key, &message_id, |message| {
            message.tool_calls = merge_by_key(&message.tool_calls, &calls);
            message.tool_results = merge_by_key(&message.tool_results, &results);
        });
        if attached {
            // A live accumulator is re-merged by later chat events and must not
            // go stale; a finished run has none and gets no new one.
            if let Some(acc) = self.tools.get_mut(&group) {
                acc.merge(&calls, &results);
            }
            ToolOutcome::Attached(message_id)
        } else {
            self.tools
                .entry(group.clone())
                .or_default()
                .merge(&calls, &results);
            debug!(session_key, group = %group, "tool event waiting for its message");
            ToolOutcome::Accumulated
        }
    }

    /// Releases the usage marker and the accumulator. Start times stay until
    /// their result arrives, which may be after the final.
    fn finish(&mut self, run: &RunKey, group: &RunKey) {
        self.usage_applied.remove(run);
        self.tools.remove(group);
    }
}

/// Adds `next` onto `base` only for the first payload a run reports; later
/// payloads for the same run are re-deliveries of the same counters.
fn accumulate_usage(
    applied: &mut HashSet<RunKey>,
    base: Option<Usage>,
    next: Option<Usage>,
    run: &RunKey,
) -> Option<Usage> {
    let Some(next) = next else {
        return base;
    };
    if !applied.insert(run.clone()) {
        return base;
    }
    Some(match base {
        Some(base) => base.accumulate(&next),
        None => next,
    })
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}
