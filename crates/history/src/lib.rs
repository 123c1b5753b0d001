use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use conversation_store::{SharedStore, lock};
use core_model::{HistoryRequest, HistorySource};
use serde::Deserialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Used when the count probe reports no total and nothing was remembered.
    pub default_limit: usize,
    pub max_limit: usize,
    /// Room for messages written between the probe and the main fetch.
    pub padding: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            default_limit: 200,
            max_limit: 1000,
            padding: 20,
        }
    }
}

impl HistoryConfig {
    fn clamp(&self, limit: usize) -> usize {
        limit.clamp(1, self.max_limit.max(1))
    }

    /// Server total plus padding, clamped. Totals beyond `usize` saturate.
    fn padded(&self, total: u64) -> usize {
        let total = usize::try_from(total).unwrap_or(usize::MAX);
        self.clamp(total.saturating_add(self.padding))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadPhase {
    Probing,
    Fetching { limit: usize },
    Normalizing { records: usize },
    Done { messages: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The conversation already had entries and no refresh was forced.
    Cached,
    /// Another load for the same conversation is still awaiting its reply.
    InFlight,
    Loaded { messages: usize, limit: usize },
    /// The fetch succeeded but local entries were kept in place of it.
    KeptLocal,
}

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("failed to fetch history for {session_key}")]
    Fetch {
        session_key: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
}

#[derive(Debug, Default)]
struct LoaderState {
    limits: HashMap<String, usize>,
    errors: HashMap<String, String>,
    loading: HashSet<String>,
}

/// Seeds the conversation store from the history service. Loads for different
/// conversations may overlap; each writes only its own conversation.
pub struct HistoryLoader<S> {
    source: S,
    config: HistoryConfig,
    state: Mutex<LoaderState>,
}

impl<S: HistorySource> HistoryLoader<S> {
    pub fn new(source: S, config: HistoryConfig) -> Self {
        Self {
            source,
            config,
            state: Mutex::new(LoaderState::default()),
        }
    }

    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    pub fn history_error(&self, session_key: &str) -> Option<String> {
        self.state().errors.get(session_key).cloned()
    }

    pub fn clear_error(&self, session_key: &str) {
        self.state().errors.remove(session_key);
    }

    pub fn is_loading(&self, session_key: &str) -> bool {
        self.state().loading.contains(session_key)
    }

    pub fn remembered_limit(&self, session_key: &str) -> Option<usize> {
        self.state().limits.get(session_key).copied()
    }

    pub async fn load(
        &self,
        store: &SharedStore,
        session_key: &str,
        force: bool,
        limit_override: Option<usize>,
        on_phase: impl Fn(LoadPhase),
    ) -> Result<LoadOutcome, HistoryError> {
        if !force && lock(store).has_entries(session_key) {
            debug!(session_key, "history already loaded");
            return Ok(LoadOutcome::Cached);
        }
        let Some(_in_flight) = InFlight::enter(&self.state, session_key) else {
            debug!(session_key, "history load already in flight");
            return Ok(LoadOutcome::InFlight);
        };

        let limit = match limit_override {
            Some(limit) => self.config.clamp(limit),
            None => {
                on_phase(LoadPhase::Probing);
                self.probe_limit(session_key).await
            }
        };

        on_phase(LoadPhase::Fetching { limit });
        let request = HistoryRequest {
            session_key: session_key.to_string(),
            limit,
        };
        let page = match self.source.fetch(request).await {
            Ok(page) => page,
            Err(err) => {
                warn!(session_key, error = %err, "history fetch failed");
                self.state()
                    .errors
                    .insert(session_key.to_string(), format!("{err:#}"));
                return Err(HistoryError::Fetch {
                    session_key: session_key.to_string(),
                    source: err.into(),
                });
            }
        };

        on_phase(LoadPhase::Normalizing {
            records: page.messages.len(),
        });
        let messages = normalize::normalize_history(session_key, &page.messages);
        let count = messages.len();

        let remembered = page
            .total_messages
            .map(|total| self.config.padded(total))
            .unwrap_or(limit);
        {
            let mut state = self.state();
            state.limits.insert(session_key.to_string(), remembered);
            state.errors.remove(session_key);
        }

        let kept_local = {
            let mut store = lock(store);
            let local = store.has_entries(session_key);
            // Local entries that appeared while awaiting, or an empty server
            // reply, never displace what the user can already see.
            if local && (!force || messages.is_empty()) {
                true
            } else {
                store.replace(session_key, messages);
                false
            }
        };
        if kept_local {
            info!(session_key, fetched = count, "kept local conversation");
            return Ok(LoadOutcome::KeptLocal);
        }

        on_phase(LoadPhase::Done { messages: count });
        info!(session_key, messages = count, limit, "history loaded");
        Ok(LoadOutcome::Loaded {
            messages: count,
            limit,
        })
    }

    /// Learns the server-side total with a one-record request. Any failure
    /// falls back to the remembered or default limit.
    async fn probe_limit(&self, session_key: &str) -> usize {
        let probe = HistoryRequest {
            session_key: session_key.to_string(),
            limit: 1,
        };
        let total = match self.source.fetch(probe).await {
            Ok(page) => page.total_messages,
            Err(err) => {
                warn!(session_key, error = %err, "history count probe failed");
                None
            }
        };
        match total {
            Some(total) => self.config.padded(total),
            None => {
                let fallback = self
                    .remembered_limit(session_key)
                    .unwrap_or(self.config.default_limit);
                self.config.clamp(fallback)
            }
        }
    }

    fn state(&self) -> MutexGuard<'_, LoaderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Marks a conversation as loading until dropped, including when the load
/// future itself is dropped mid-await.
struct InFlight<'a> {
    state: &'a Mutex<LoaderState>,
    session_key: String,
}

impl<'a> InFlight<'a> {
    fn enter(state: &'a Mutex<LoaderState>, session_key: &str) -> Option<Self> {
        let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
        if !guard.loading.insert(session_key.to_string()) {
            return None;
        }
        Some(Self {
            state,
            session_key: session_key.to_string(),
        })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .loading
            .remove(&self.session_key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use conversation_store::{ConversationStore, shared};
    use core_model::{HistoryPage, Message, Role};
    use serde_json::{Value, json};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    #[derive(Default)]
    struct FakeSource {
        records: Vec<Value>,
        report_total: bool,
        fail_probe: bool,
        fail_fetch: bool,
        /// Reported instead of the record count when set.
        claimed_total: Option<u64>,
        calls: AtomicUsize,
        requests: Mutex<Vec<HistoryRequest>>,
    }

    impl FakeSource {
        fn with_records(n: usize) -> Self {
            let records = (0..n)
                .map(|i| {
                    let role = if i % 2 == 0 { "user" } else { "assistant" };
                    json!({"role": role, "content": format!("m{i}")})
                })
                .collect();
            Self {
                records,
                report_total: true,
                ..Default::default()
            }
        }

        fn limits(&self) -> Vec<usize> {
            self.requests.lock().unwrap().iter().map(|r| r.limit).collect()
        }
    }

    #[async_trait]
    impl HistorySource for FakeSource {
        async fn fetch(&self, request: HistoryRequest) -> anyhow::Result<HistoryPage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let probe = request.limit == 1;
            self.requests.lock().unwrap().push(request.clone());
            if (probe && self.fail_probe) || (!probe && self.fail_fetch) {
                anyhow::bail!("connection reset");
            }
            let start = self.records.len().saturating_sub(request.limit);
            Ok(HistoryPage {
                messages: self.records[start..].to_vec(),
                total_messages: self
                    .report_total
                    .then(|| self.claimed_total.unwrap_or(self.records.len() as u64)),
            })
        }
    }

    fn local(content: &str) -> Message {
        Message::new("local-1", Role::User, content, Utc::now())
    }

    #[tokio::test]
    async fn absurd_total_is_clamped_to_max_limit() {
        let source = FakeSource {
            claimed_total: Some(u64::MAX),
            ..FakeSource::with_records(3)
        };
        let loader = HistoryLoader::new(source, HistoryConfig::default());
        let store = shared(ConversationStore::new());

        let outcome = loader.load(&store, "s", false, None, |_| {}).await.unwrap();
        assert_eq!(outcome, LoadOutcome::Loaded { messages: 3, limit: 1000 });
        assert_eq!(loader.source.limits(), vec![1, 1000]);
        assert_eq!(loader.remembered_limit("s"), Some(1000));
    }

    #[tokio::test]
    async fn second_load_without_force_is_cached() {
        let loader = HistoryLoader::new(FakeSource::with_records(3), HistoryConfig::default());
        let store = shared(ConversationStore::new());

        let first = loader.load(&store, "s", false, None, |_| {}).await.unwrap();
        assert_eq!(first, LoadOutcome::Loaded { messages: 3, limit: 23 });
        let calls = loader.source.calls.load(Ordering::SeqCst);
        let before: Vec<String> = lock(&store).messages("s").iter().map(|m| m.id.clone()).collect();

        let second = loader.load(&store, "s", false, None, |_| {}).await.unwrap();
        assert_eq!(second, LoadOutcome::Cached);
        assert_eq!(loader.source.calls.load(Ordering::SeqCst), calls);
        let after: Vec<String> = lock(&store).messages("s").iter().map(|m| m.id.clone()).collect();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn probe_then_padded_fetch() {
        let loader = HistoryLoader::new(FakeSource::with_records(5), HistoryConfig::default());
        let store = shared(ConversationStore::new());
        let phases = Mutex::new(Vec::new());

        loader
            .load(&store, "s", false, None, |p| phases.lock().unwrap().push(p))
            .await
            .unwrap();

        assert_eq!(loader.source.limits(), vec![1, 25]);
        assert_eq!(loader.remembered_limit("s"), Some(25));
        assert_eq!(
            phases.into_inner().unwrap(),
            vec![
                LoadPhase::Probing,
                LoadPhase::Fetching { limit: 25 },
                LoadPhase::Normalizing { records: 5 },
                LoadPhase::Done { messages: 5 },
            ]
        );
    }

    #[tokio::test]
    async fn missing_total_falls_back_to_default() {
        let mut source = FakeSource::with_records(2);
        source.report_total = false;
        let loader = HistoryLoader::new(source, HistoryConfig::default());
        let store = shared(ConversationStore::new());

        let outcome = loader.load(&store, "s", false, None, |_| {}).await.unwrap();
        assert_eq!(outcome, LoadOutcome::Loaded { messages: 2, limit: 200 });
        assert_eq!(loader.source.limits(), vec![1, 200]);
    }

    #[tokio::test]
    async fn failed_probe_uses_remembered_limit() {
        let mut source = FakeSource::with_records(4);
        source.fail_probe = true;
        let loader = HistoryLoader::new(source, HistoryConfig::default());
        loader.state().limits.insert("s".to_string(), 24);
        let store = shared(ConversationStore::new());

        let outcome = loader.load(&store, "s", false, None, |_| {}).await.unwrap();
        assert_eq!(outcome, LoadOutcome::Loaded { messages: 4, limit: 24 });
        assert_eq!(loader.source.limits(), vec![1, 24]);
        assert!(loader.history_error("s").is_none());
    }

    #[tokio::test]
    async fn override_skips_probe_and_is_clamped() {
        let config = HistoryConfig {
            max_limit: 50,
            ..HistoryConfig::default()
        };
        let loader = HistoryLoader::new(FakeSource::with_records(3), config);
        let store = shared(ConversationStore::new());
        loader.load(&store, "s", false, Some(500), |_| {}).await.unwrap();
        assert_eq!(loader.source.limits(), vec![50]);

        loader.load(&store, "t", false, Some(0), |_| {}).await.unwrap();
        assert_eq!(loader.source.limits(), vec![50, 1]);
    }

    #[tokio::test]
    async fn fetch_failure_keeps_store_and_flags_error() {
        let mut source = FakeSource::with_records(3);
        source.fail_fetch = true;
        let loader = HistoryLoader::new(source, HistoryConfig::default());
        let store = shared(ConversationStore::new());
        lock(&store).append("s", local("draft"));

        let err = loader.load(&store, "s", true, None, |_| {}).await.unwrap_err();
        assert!(matches!(err, HistoryError::Fetch { ref session_key, .. } if session_key == "s"));
        assert!(loader.history_error("s").unwrap().contains("connection reset"));
        assert_eq!(lock(&store).messages("s").len(), 1);
        assert!(!loader.is_loading("s"));

        loader.clear_error("s");
        assert!(loader.history_error("s").is_none());
    }

    #[tokio::test]
    async fn force_replaces_existing_entries() {
        let loader = HistoryLoader::new(FakeSource::with_records(2), HistoryConfig::default());
        let store = shared(ConversationStore::new());
        lock(&store).append("s", local("stale"));

        let outcome = loader.load(&store, "s", true, None, |_| {}).await.unwrap();
        assert_eq!(outcome, LoadOutcome::Loaded { messages: 2, limit: 22 });
        let contents: Vec<String> =
            lock(&store).messages("s").iter().map(|m| m.content.clone()).collect();
        assert_eq!(contents, vec!["m0", "m1"]);
    }

    #[tokio::test]
    async fn empty_reply_never_erases_local_state() {
        let loader = HistoryLoader::new(FakeSource::with_records(0), HistoryConfig::default());
        let store = shared(ConversationStore::new());
        lock(&store).append("s", local("typed while offline"));

        let outcome = loader.load(&store, "s", true, None, |_| {}).await.unwrap();
        assert_eq!(outcome, LoadOutcome::KeptLocal);
        assert_eq!(lock(&store).messages("s")[0].content, "typed while offline");
    }

    #[tokio::test]
    async fn loads_write_only_their_own_conversation() {
        let loader = HistoryLoader::new(FakeSource::with_records(2), HistoryConfig::default());
        let store = shared(ConversationStore::new());
        lock(&store).append("active", local("keep me"));

        loader.load(&store, "other", false, None, |_| {}).await.unwrap();
        assert_eq!(lock(&store).messages("active").len(), 1);
        assert_eq!(lock(&store).messages("other").len(), 2);
    }

    struct GatedSource {
        entered: Arc<Notify>,
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl HistorySource for GatedSource {
        async fn fetch(&self, _request: HistoryRequest) -> anyhow::Result<HistoryPage> {
            self.entered.notify_one();
            self.gate.notified().await;
            Ok(HistoryPage {
                messages: vec![json!({"role": "assistant", "content": "late"})],
                total_messages: Some(1),
            })
        }
    }

    #[tokio::test]
    async fn concurrent_load_reports_in_flight() {
        let entered = Arc::new(Notify::new());
        let gate = Arc::new(Notify::new());
        let loader = HistoryLoader::new(
            GatedSource {
                entered: Arc::clone(&entered),
                gate: Arc::clone(&gate),
            },
            HistoryConfig::default(),
        );
        let store = shared(ConversationStore::new());

        let first = loader.load(&store, "s", false, Some(10), |_| {});
        let second = async {
            entered.notified().await;
            assert!(loader.is_loading("s"));
            let outcome = loader.load(&store, "s", false, Some(10), |_| {}).await;
            gate.notify_one();
            outcome
        };
        let (first, second) = tokio::join!(first, second);

        assert_eq!(first.unwrap(), LoadOutcome::Loaded { messages: 1, limit: 10 });
        assert_eq!(second.unwrap(), LoadOutcome::InFlight);
        assert!(!loader.is_loading("s"));
    }
}
