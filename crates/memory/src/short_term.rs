//! Short-term memory: the per-session turn log plus retention policies.
//!
//! The underlying [`TurnLog`] is append-only. Retention only shapes what a
//! read returns; the summary policy keeps its running digest beside the log
//! rather than rewriting it.

use contextloop_config::{MemoryConfig, ShortTermStrategy};
use contextloop_core::error::MemoryError;
use contextloop_core::memory::TurnLog;
use contextloop_core::message::{ConversationTurn, Message, SessionId};
use contextloop_core::provider::{Provider, ProviderRequest};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

const SUMMARY_PROMPT: &str = "Summarize the following conversation concisely:";

/// What a read returns for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Everything in the log.
    Buffer,
    /// The last `size` turns.
    Window { size: usize },
    /// Turns older than the newest `keep_recent` are folded into a digest once
    /// at least `batch` of them are uncovered.
    Summary { keep_recent: usize, batch: usize },
}

impl RetentionPolicy {
    pub fn from_config(config: &MemoryConfig) -> Self {
        match config.strategy {
            ShortTermStrategy::Buffer => RetentionPolicy::Buffer,
            ShortTermStrategy::Window => RetentionPolicy::Window {
                size: config.window_size.max(1),
            },
            ShortTermStrategy::Summary => RetentionPolicy::Summary {
                keep_recent: config.summary_keep_recent.max(1),
                batch: config.summary_batch.max(1),
            },
        }
    }
}

/// The result of a read: turns oldest first, plus any degradation notes.
#[derive(Debug, Clone, Default)]
pub struct ShortTermView {
    pub turns: Vec<ConversationTurn>,
    pub warnings: Vec<String>,
}

impl ShortTermView {
    /// `role: content` lines, the form the context builder consumes.
    pub fn text(&self) -> String {
        render_transcript(&self.turns)
    }
}

/// Format turns as `role: content` lines.
pub fn render_transcript(turns: &[ConversationTurn]) -> String {
    turns
        .iter()
        .map(|t| format!("{}: {}", t.role, t.content))
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Clone)]
struct Digest {
    text: String,
    covers_through: u64,
    last_timestamp: chrono::DateTime<chrono::Utc>,
}

impl Digest {
    fn as_turn(&self) -> ConversationTurn {
        ConversationTurn::system(format!("Summary of earlier conversation: {}", self.text))
            .with_timestamp(self.last_timestamp)
            .with_metadata("digest", serde_json::Value::Bool(true))
            .with_metadata("covers_through", serde_json::Value::from(self.covers_through))
    }
}

/// Per-session short-term store.
pub struct ShortTermStore {
    log: Arc<dyn TurnLog>,
    summarizer: Option<Arc<dyn Provider>>,
    summary_model: String,
    append_locks: Mutex<HashMap<SessionId, Arc<Mutex<()>>>>,
    digests: RwLock<HashMap<SessionId, Digest>>,
}

impl ShortTermStore {
    pub fn new(log: Arc<dyn TurnLog>) -> Self {
        Self {
            log,
            summarizer: None,
            summary_model: String::new(),
            append_locks: Mutex::new(HashMap::new()),
            digests: RwLock::new(HashMap::new()),
        }
    }

    /// Attach the LLM used by the summary policy.
    pub fn with_summarizer(mut self, provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        self.summarizer = Some(provider);
        self.summary_model = model.into();
        self
    }

    pub fn log(&self) -> &Arc<dyn TurnLog> {
        &self.log
    }

    async fn session_lock(&self, session: &SessionId) -> Arc<Mutex<()>> {
        let mut locks = self.append_locks.lock().await;
        locks.entry(session.clone()).or_default().clone()
    }

    /// Append a turn. Appends to one session are serialized; other sessions
    /// and readers are not blocked.
    pub async fn append(&self, session: &SessionId, turn: ConversationTurn) -> Result<ConversationTurn, MemoryError> {
        let lock = self.session_lock(session).await;
        let _guard = lock.lock().await;
        let stored = self.log.append(session, turn).await?;
        debug!(session = %session, seq = stored.seq, role = %stored.role, "Appended turn");
        Ok(stored)
    }

    /// Forget a session: its log and its digest. Returns how many turns were dropped.
    pub async fn clear(&self, session: &SessionId) -> Result<usize, MemoryError> {
        let lock = self.session_lock(session).await;
        let _guard = lock.lock().await;
        let removed = self.log.clear(session).await?;
        self.digests.write().await.remove(session);
        debug!(session = %session, removed, "Cleared session");
        Ok(removed)
    }

    /// Read a session under `policy`. `limit` caps the verbatim turns returned
    /// (a digest turn does not count against it).
    ///
    /// Summarization problems never fail the read: the uncovered turns come
    /// back verbatim with a warning.
    pub async fn read(
        &self,
        session: &SessionId,
        limit: Option<usize>,
        policy: RetentionPolicy,
    ) -> Result<ShortTermView, MemoryError> {
        let mut view = match policy {
            RetentionPolicy::Buffer => ShortTermView {
                turns: self.log.read(session, None).await?,
                warnings: Vec::new(),
            },
            RetentionPolicy::Window { size } => ShortTermView {
                turns: self.log.read(session, Some(size)).await?,
                warnings: Vec::new(),
            },
            RetentionPolicy::Summary { keep_recent, batch } => {
                self.read_summarized(session, keep_recent, batch).await?
            }
        };

        if let Some(limit) = limit {
            apply_limit(&mut view.turns, limit);
        }
        Ok(view)
    }

    async fn read_summarized(
        &self,
        session: &SessionId,
        keep_recent: usize,
        batch: usize,
    ) -> Result<ShortTermView, MemoryError> {
        let turns = self.log.read(session, None).await?;
        let mut warnings = Vec::new();
        let mut digest = self.digests.read().await.get(session).cloned();

        let split = turns.len().saturating_sub(keep_recent);
        let (stale, recent) = turns.split_at(split);
        let covered = digest.as_ref().map_or(0, |d| d.covers_through);
        let mut pending: Vec<ConversationTurn> = stale.iter().filter(|t| t.seq > covered).cloned().collect();

        if pending.len() >= batch {
            match self.summarize(digest.as_ref(), &pending).await {
                Ok(text) => {
                    let last = &pending[pending.len() - 1];
                    let fresh = Digest {
                        text,
                        covers_through: last.seq,
                        last_timestamp: last.timestamp,
                    };
                    let mut digests = self.digests.write().await;
                    let slot = digests.entry(session.clone()).or_insert_with(|| fresh.clone());
                    if slot.covers_through < fresh.covers_through {
                        *slot = fresh;
                    }
                    debug!(session = %session, covers_through = slot.covers_through, "Refreshed conversation digest");
                    digest = Some(slot.clone());
                    let covered = slot.covers_through;
                    pending.retain(|t| t.seq > covered);
                }
                Err(e) => {
                    warn!(session = %session, error = %e, "Summarization failed, returning raw turns");
                    warnings.push(format!(
                        "summarization failed ({e}); {} older turns returned verbatim",
                        pending.len()
                    ));
                }
            }
        }

        let mut out = Vec::with_capacity(1 + pending.len() + recent.len());
        if let Some(d) = &digest {
            out.push(d.as_turn());
        }
        out.extend(pending);
        out.extend_from_slice(recent);
        Ok(ShortTermView { turns: out, warnings })
    }

    async fn summarize(&self, previous: Option<&Digest>, turns: &[ConversationTurn]) -> Result<String, MemoryError> {
        let provider = self
            .summarizer
            .as_ref()
            .ok_or_else(|| MemoryError::Summarization("no summarization model configured".into()))?;

        let mut prompt = String::from(SUMMARY_PROMPT);
        prompt.push_str("\n\n");
        if let Some(previous) = previous {
            prompt.push_str("Existing summary:\n");
            prompt.push_str(&previous.text);
            prompt.push_str("\n\nNew messages:\n");
        }
        prompt.push_str(&render_transcript(turns));

        let request = ProviderRequest::new(self.summary_model.clone(), vec![Message::user(prompt)]).with_temperature(0.3);
        let response = provider
            .complete(request)
            .await
            .map_err(|e| MemoryError::Summarization(e.to_string()))?;

        let text = response.text().trim().to_string();
        if text.is_empty() {
            return Err(MemoryError::Summarization("model returned an empty summary".into()));
        }
        Ok(text)
    }
}

/// Keep the last `limit` verbatim turns, preserving a leading digest.
fn apply_limit(turns: &mut Vec<ConversationTurn>, limit: usize) {
    let has_digest = turns.first().is_some_and(|t| t.metadata.contains_key("digest"));
    let verbatim = turns.len() - usize::from(has_digest);
    if verbatim <= limit {
        return;
    }
    let start = usize::from(has_digest);
    turns.drain(start..start + (verbatim - limit));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::InMemoryTurnLog;
    use async_trait::async_trait;
    use contextloop_core::error::ProviderError;
    use contextloop_core::message::Role;
    use contextloop_core::provider::ProviderResponse;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SummaryProvider {
        reply: Result<String, ProviderError>,
        calls: AtomicUsize,
    }

    impl SummaryProvider {
        fn ok(text: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(text.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                reply: Err(ProviderError::Network("connection refused".into())),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Provider for SummaryProvider {
        fn name(&self) -> &str {
            "summary_mock"
        }

        async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(request.messages[0].content.starts_with(SUMMARY_PROMPT));
            let text = self.reply.clone()?;
            Ok(ProviderResponse {
                message: Message::assistant(text),
                usage: None,
                model: "mock".into(),
                metadata: serde_json::Map::new(),
            })
        }
    }

    fn session() -> SessionId {
        SessionId::from("s1")
    }

    async fn store_with(turns: usize, provider: Option<Arc<SummaryProvider>>) -> ShortTermStore {
        let mut store = ShortTermStore::new(Arc::new(InMemoryTurnLog::new()));
        if let Some(p) = provider {
            store = store.with_summarizer(p, "mock");
        }
        for i in 1..=turns {
            store
                .append(&session(), ConversationTurn::user(format!("message {i}")))
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn buffer_returns_full_log() {
        let store = store_with(15, None).await;
        let view = store.read(&session(), None, RetentionPolicy::Buffer).await.unwrap();
        assert_eq!(view.turns.len(), 15);
        assert!(view.warnings.is_empty());
    }

    #[tokio::test]
    async fn window_returns_last_k() {
        let store = store_with(15, None).await;
        let view = store
            .read(&session(), None, RetentionPolicy::Window { size: 4 })
            .await
            .unwrap();
        let seqs: Vec<u64> = view.turns.iter().map(|t| t.seq).collect();
        assert_eq!(seqs, vec![12, 13, 14, 15]);
    }

    #[tokio::test]
    async fn limit_caps_result() {
        let store = store_with(6, None).await;
        let view = store.read(&session(), Some(2), RetentionPolicy::Buffer).await.unwrap();
        assert_eq!(view.turns.len(), 2);
        assert_eq!(view.turns[1].content, "message 6");
    }

    #[tokio::test]
    async fn summary_folds_stale_turns_into_digest() {
        let provider = SummaryProvider::ok("User counted to eight.");
        let store = store_with(12, Some(provider.clone())).await;
        let policy = RetentionPolicy::Summary { keep_recent: 4, batch: 5 };

        let view = store.read(&session(), None, policy).await.unwrap();
        assert!(view.warnings.is_empty());
        assert_eq!(view.turns.len(), 5);
        assert_eq!(view.turns[0].role, Role::System);
        assert!(view.turns[0].content.contains("User counted to eight."));
        assert_eq!(view.turns[0].metadata["covers_through"], 8);
        assert_eq!(view.turns[1].seq, 9);

        // A second read reuses the digest without another call.
        store.read(&session(), None, policy).await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn summary_below_batch_stays_verbatim() {
        let provider = SummaryProvider::ok("unused");
        let store = store_with(6, Some(provider.clone())).await;
        let policy = RetentionPolicy::Summary { keep_recent: 4, batch: 5 };

        let view = store.read(&session(), None, policy).await.unwrap();
        assert_eq!(view.turns.len(), 6);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn summary_failure_falls_back_with_warning() {
        let store = store_with(12, Some(SummaryProvider::failing())).await;
        let policy = RetentionPolicy::Summary { keep_recent: 4, batch: 5 };

        let view = store.read(&session(), None, policy).await.unwrap();
        assert_eq!(view.turns.len(), 12);
        assert_eq!(view.turns[0].seq, 1);
        assert_eq!(view.warnings.len(), 1);
        assert!(view.warnings[0].contains("summarization failed"));
    }

    #[tokio::test]
    async fn summary_without_model_warns_instead_of_failing() {
        let store = store_with(12, None).await;
        let policy = RetentionPolicy::Summary { keep_recent: 4, batch: 5 };
        let view = store.read(&session(), None, policy).await.unwrap();
        assert_eq!(view.turns.len(), 12);
        assert!(view.warnings[0].contains("no summarization model"));
    }

    #[tokio::test]
    async fn digest_is_kept_when_limit_applies() {
        let provider = SummaryProvider::ok("Earlier stuff.");
        let store = store_with(12, Some(provider)).await;
        let policy = RetentionPolicy::Summary { keep_recent: 4, batch: 5 };
        let view = store.read(&session(), Some(2), policy).await.unwrap();
        assert_eq!(view.turns.len(), 3);
        assert!(view.turns[0].metadata.contains_key("digest"));
        assert_eq!(view.turns[2].seq, 12);
    }

    #[tokio::test]
    async fn clear_forgets_turns_and_digest() {
        let provider = SummaryProvider::ok("Old news.");
        let store = store_with(12, Some(provider.clone())).await;
        let policy = RetentionPolicy::Summary { keep_recent: 4, batch: 5 };
        store.read(&session(), None, policy).await.unwrap();

        assert_eq!(store.clear(&session()).await.unwrap(), 12);
        assert!(store.read(&session(), None, policy).await.unwrap().turns.is_empty());

        // A fresh log must not inherit the old digest.
        for i in 1..=3 {
            store.append(&session(), ConversationTurn::user(format!("new {i}"))).await.unwrap();
        }
        let view = store.read(&session(), None, policy).await.unwrap();
        assert_eq!(view.turns.len(), 3);
        assert_eq!(view.turns[0].role, Role::User);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn transcript_renders_role_prefixes() {
        let turns = vec![ConversationTurn::user("hi"), ConversationTurn::assistant("hello")];
        assert_eq!(render_transcript(&turns), "user: hi\nassistant: hello");
    }

    #[test]
    fn policy_from_config() {
        let config = MemoryConfig {
            strategy: ShortTermStrategy::Window,
            window_size: 3,
            ..MemoryConfig::default()
        };
        assert_eq!(RetentionPolicy::from_config(&config), RetentionPolicy::Window { size: 3 });
    }

    /// A log that yields between computing the next seq and publishing it, so
    /// unserialized appends would collide.
    struct RacyLog {
        turns: std::sync::Mutex<Vec<ConversationTurn>>,
    }

    #[async_trait]
    impl TurnLog for RacyLog {
        async fn append(&self, _session: &SessionId, mut turn: ConversationTurn) -> Result<ConversationTurn, MemoryError> {
            let next = self.turns.lock().unwrap().len() as u64 + 1;
            tokio::task::yield_now().await;
            turn.seq = next;
            self.turns.lock().unwrap().push(turn.clone());
            Ok(turn)
        }

        async fn read(&self, _session: &SessionId, _limit: Option<usize>) -> Result<Vec<ConversationTurn>, MemoryError> {
            Ok(self.turns.lock().unwrap().clone())
        }

        async fn read_after(&self, _session: &SessionId, after: u64) -> Result<Vec<ConversationTurn>, MemoryError> {
            Ok(self.turns.lock().unwrap().iter().filter(|t| t.seq > after).cloned().collect())
        }

        async fn count(&self, _session: &SessionId) -> Result<usize, MemoryError> {
            Ok(self.turns.lock().unwrap().len())
        }

        async fn clear(&self, _session: &SessionId) -> Result<usize, MemoryError> {
            Ok(std::mem::take(&mut *self.turns.lock().unwrap()).len())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_to_one_session_are_serialized() {
        let log = Arc::new(RacyLog {
            turns: std::sync::Mutex::new(Vec::new()),
        });
        let store = Arc::new(ShortTermStore::new(log.clone()));

        let handles: Vec<_> = (0..32)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .append(&SessionId::from("s1"), ConversationTurn::user(format!("m{i}")))
                        .await
                        .unwrap()
                })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }

        let seqs: Vec<u64> = log.turns.lock().unwrap().iter().map(|t| t.seq).collect();
        assert_eq!(seqs, (1..=32).collect::<Vec<u64>>());
    }
}
