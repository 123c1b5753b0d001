//! Client-local send lifecycle: optimistic user messages and the pending
//! assistant placeholder for an accepted run.

use std::fmt::Display;

use chrono::{DateTime, Utc};
use conversation_store::{SharedStore, lock};
use core_model::{Message, MessageStatus, RetryPayload, Role};
use tracing::{debug, warn};

use crate::group_key;

/// Appends an optimistic user message and returns its id.
pub fn begin_send(store: &SharedStore, session_key: &str, text: &str, now: DateTime<Utc>) -> String {
    let mut store = lock(store);
    let base = format!("msg-{}", now.timestamp_millis());
    let mut id = base.clone();
    let mut suffix = 1;
    while store.contains(session_key, &id) {
        id = format!("{base}-{suffix}");
        suffix += 1;
    }
    let mut message = Message::new(&id, Role::User, text, now);
    message.status = Some(MessageStatus::Sending);
    message.retry_payload = Some(RetryPayload {
        message: text.to_string(),
    });
    store.append(session_key, message);
    id
}

/// Settles a send. Failures keep the retry payload so the text can be resent,
/// edited or copied.
pub fn resolve_send<E: Display>(
    store: &SharedStore,
    session_key: &str,
    id: &str,
    result: Result<(), E>,
) -> bool {
    let found = lock(store).update(session_key, id, |message| match &result {
        Ok(()) => {
            message.status = None;
            message.retry_payload = None;
        }
        Err(_) => {
            message.status = Some(MessageStatus::Failed);
            if message.retry_payload.is_none() {
                message.retry_payload = Some(RetryPayload {
                    message: message.content.clone(),
                });
            }
        }
    });
    if let Err(err) = &result {
        warn!(session_key, id, error = %err, "send failed");
    }
    found
}

/// Flips a failed message back to sending and hands back the text to resend.
pub fn retry_send(store: &SharedStore, session_key: &str, id: &str) -> Option<String> {
    let mut store = lock(store);
    let message = store.find_mut(session_key, id)?;
    let text = message.retry_payload.as_ref()?.message.clone();
    message.status = Some(MessageStatus::Sending);
    Some(text)
}

/// Inserts the empty assistant placeholder for a run the server accepted,
/// under the same turn-or-run id its live events will use. Returns false when
/// that message already exists.
pub fn mark_run_pending(
    store: &SharedStore,
    session_key: &str,
    run_id: &str,
    turn_id: Option<&str>,
    now: DateTime<Utc>,
) -> bool {
    let id = group_key(session_key, run_id, turn_id).message_id();
    let mut store = lock(store);
    if store.contains(session_key, &id) {
        debug!(session_key, run_id, "run already has a message");
        return false;
    }
    let mut placeholder = Message::new(id, Role::Assistant, "", now);
    placeholder.status = Some(MessageStatus::Waiting);
    store.append(session_key, placeholder);
    true
}
