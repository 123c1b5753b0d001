use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use core_model::Message;
use tracing::debug;

/// Handle passed to every component that reads or writes conversations.
pub type SharedStore = Arc<Mutex<ConversationStore>>;

pub fn shared(store: ConversationStore) -> SharedStore {
    Arc::new(Mutex::new(store))
}

/// Locks the store. A writer that panicked mid-update leaves whole messages
/// behind, so the poisoned guard is still usable.
pub fn lock(store: &SharedStore) -> MutexGuard<'_, ConversationStore> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ordered message list per conversation. Lists only grow by append once
/// seeded; existing entries are updated in place by id.
#[derive(Debug, Default)]
pub struct ConversationStore {
    conversations: HashMap<String, Vec<Message>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self, session_key: &str) -> &[Message] {
        self.conversations
            .get(session_key)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn has_entries(&self, session_key: &str) -> bool {
        !self.messages(session_key).is_empty()
    }

    pub fn contains(&self, session_key: &str, id: &str) -> bool {
        self.find(session_key, id).is_some()
    }

    pub fn find(&self, session_key: &str, id: &str) -> Option<&Message> {
        self.messages(session_key).iter().find(|m| m.id == id)
    }

    pub fn find_mut(&mut self, session_key: &str, id: &str) -> Option<&mut Message> {
        self.conversations
            .get_mut(session_key)?
            .iter_mut()
            .find(|m| m.id == id)
    }

    /// Seeds (or force-refreshes) a conversation with a complete list.
    pub fn replace(&mut self, session_key: &str, messages: Vec<Message>) {
        debug!(session_key, messages = messages.len(), "replacing conversation");
        self.conversations.insert(session_key.to_string(), messages);
    }

    pub fn append(&mut self, session_key: &str, message: Message) {
        self.conversations
            .entry(session_key.to_string())
            .or_default()
            .push(message);
    }

    /// Replaces the message sharing `message.id`, or appends it. Returns true
    /// when an existing entry was replaced.
    pub fn upsert(&mut self, session_key: &str, message: Message) -> bool {
        match self.find_mut(session_key, &message.id) {
            Some(slot) => {
                *slot = message;
                true
            }
            None => {
                self.append(session_key, message);
                false
            }
        }
    }

    /// Applies `f` to the message with `id`; returns false if there is none.
    pub fn update(&mut self, session_key: &str, id: &str, f: impl FnOnce(&mut Message)) -> bool {
        match self.find_mut(session_key, id) {
            Some(message) => {
                f(message);
                true
            }
            None => false,
        }
    }

    pub fn remove_conversation(&mut self, session_key: &str) -> Option<Vec<Message>> {
        self.conversations.remove(session_key)
    }

    pub fn sessions(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.conversations.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    /// Frozen copy of one conversation; later writes are not observed.
    pub fn snapshot(&self, session_key: &str) -> Arc<[Message]> {
        Arc::from(self.messages(session_key))
    }
}
