//! In-memory stores, useful for testing and ephemeral sessions.
//!
//! Each store keeps its state behind a single `tokio::sync::RwLock`, so every
//! write is published atomically to readers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use contextloop_core::error::MemoryError;
use contextloop_core::memory::{
    EpisodicSummary, FactMatch, LongTermCounts, LongTermStore, MemoryKind, ProceduralPattern, ProfileRecord,
    ProfileStore, SemanticFact, TurnLog, keyword_score,
};
use contextloop_core::message::{ConversationTurn, SessionId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Per-session turn logs held in a map of vectors.
pub struct InMemoryTurnLog {
    sessions: Arc<RwLock<HashMap<SessionId, Vec<ConversationTurn>>>>,
}

impl InMemoryTurnLog {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryTurnLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TurnLog for InMemoryTurnLog {
    async fn append(&self, session: &SessionId, mut turn: ConversationTurn) -> Result<ConversationTurn, MemoryError> {
        let mut sessions = self.sessions.write().await;
        let log = sessions.entry(session.clone()).or_default();
        turn.seq = log.last().map_or(1, |t| t.seq + 1);
        log.push(turn.clone());
        Ok(turn)
    }

    async fn read(&self, session: &SessionId, limit: Option<usize>) -> Result<Vec<ConversationTurn>, MemoryError> {
        let sessions = self.sessions.read().await;
        let Some(log) = sessions.get(session) else {
            return Ok(Vec::new());
        };
        let skip = limit.map_or(0, |n| log.len().saturating_sub(n));
        Ok(log[skip..].to_vec())
    }

    async fn read_after(&self, session: &SessionId, after_seq: u64) -> Result<Vec<ConversationTurn>, MemoryError> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .get(session)
            .map(|log| log.iter().filter(|t| t.seq > after_seq).cloned().collect())
            .unwrap_or_default())
    }

    async fn count(&self, session: &SessionId) -> Result<usize, MemoryError> {
        Ok(self.sessions.read().await.get(session).map_or(0, Vec::len))
    }

    async fn clear(&self, session: &SessionId) -> Result<usize, MemoryError> {
        Ok(self.sessions.write().await.remove(session).map_or(0, |log| log.len()))
    }
}

#[derive(Default)]
struct SessionMemory {
    facts: Vec<SemanticFact>,
    episodes: Vec<EpisodicSummary>,
    patterns: Vec<ProceduralPattern>,
    watermarks: HashMap<MemoryKind, u64>,
}

/// Per-session long-term rows.
pub struct InMemoryLongTermStore {
    sessions: Arc<RwLock<HashMap<SessionId, SessionMemory>>>,
}

impl InMemoryLongTermStore {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryLongTermStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LongTermStore for InMemoryLongTermStore {
    async fn add_facts(&self, session: &SessionId, facts: Vec<SemanticFact>) -> Result<(), MemoryError> {
        let mut sessions = self.sessions.write().await;
        sessions.entry(session.clone()).or_default().facts.extend(facts);
        Ok(())
    }

    async fn facts(&self, session: &SessionId, limit: usize) -> Result<Vec<SemanticFact>, MemoryError> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .get(session)
            .map(|m| {
                let skip = m.facts.len().saturating_sub(limit);
                m.facts[skip..].to_vec()
            })
            .unwrap_or_default())
    }

    async fn add_episode(&self, session: &SessionId, episode: EpisodicSummary) -> Result<(), MemoryError> {
        let mut sessions = self.sessions.write().await;
        sessions.entry(session.clone()).or_default().episodes.push(episode);
        Ok(())
    }

    async fn latest_episode(&self, session: &SessionId) -> Result<Option<EpisodicSummary>, MemoryError> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(session).and_then(|m| m.episodes.last().cloned()))
    }

    async fn record_patterns(
        &self,
        session: &SessionId,
        names: &[String],
        seen_at: DateTime<Utc>,
    ) -> Result<Vec<ProceduralPattern>, MemoryError> {
        let mut sessions = self.sessions.write().await;
        let memory = sessions.entry(session.clone()).or_default();
        let mut updated = Vec::with_capacity(names.len());
        for name in names {
            let pattern = match memory.patterns.iter_mut().find(|p| &p.name == name) {
                Some(existing) => {
                    existing.frequency += 1;
                    existing.last_used = seen_at;
                    existing.clone()
                }
                None => {
                    let fresh = ProceduralPattern {
                        name: name.clone(),
                        frequency: 1,
                        last_used: seen_at,
                    };
                    memory.patterns.push(fresh.clone());
                    fresh
                }
            };
            updated.push(pattern);
        }
        Ok(updated)
    }

    async fn patterns(&self, session: &SessionId) -> Result<Vec<ProceduralPattern>, MemoryError> {
        let sessions = self.sessions.read().await;
        let mut patterns = sessions.get(session).map(|m| m.patterns.clone()).unwrap_or_default();
        patterns.sort_by(|a, b| b.frequency.cmp(&a.frequency).then_with(|| a.name.cmp(&b.name)));
        Ok(patterns)
    }

    async fn watermark(&self, session: &SessionId, kind: MemoryKind) -> Result<u64, MemoryError> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .get(session)
            .and_then(|m| m.watermarks.get(&kind).copied())
            .unwrap_or(0))
    }

    async fn set_watermark(&self, session: &SessionId, kind: MemoryKind, seq: u64) -> Result<(), MemoryError> {
        let mut sessions = self.sessions.write().await;
        let marks = &mut sessions.entry(session.clone()).or_default().watermarks;
        let current = marks.entry(kind).or_insert(0);
        *current = (*current).max(seq);
        Ok(())
    }

    async fn search_facts(&self, session: &SessionId, query: &str, limit: usize) -> Result<Vec<FactMatch>, MemoryError> {
        let sessions = self.sessions.read().await;
        let Some(memory) = sessions.get(session) else {
            return Ok(Vec::new());
        };
        // Newest first, so the stable sort breaks score ties by recency.
        let mut matches: Vec<FactMatch> = memory
            .facts
            .iter()
            .rev()
            .map(|fact| FactMatch {
                score: keyword_score(query, &fact.text),
                fact: fact.clone(),
            })
            .filter(|m| m.score > 0.0)
            .collect();
        matches.sort_by(|a, b| b.score.total_cmp(&a.score));
        matches.truncate(limit);
        Ok(matches)
    }

    async fn counts(&self, session: &SessionId) -> Result<LongTermCounts, MemoryError> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .get(session)
            .map(|m| LongTermCounts {
                facts: m.facts.len(),
                episodes: m.episodes.len(),
                patterns: m.patterns.len(),
            })
            .unwrap_or_default())
    }

    async fn clear(&self, session: &SessionId) -> Result<(), MemoryError> {
        self.sessions.write().await.remove(session);
        Ok(())
    }
}

/// The global profile row with a version column.
pub struct InMemoryProfileStore {
    record: Arc<RwLock<ProfileRecord>>,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self {
            record: Arc::new(RwLock::new(ProfileRecord::default())),
        }
    }
}

impl Default for InMemoryProfileStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn load(&self) -> Result<ProfileRecord, MemoryError> {
        Ok(self.record.read().await.clone())
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        data: serde_json::Map<String, serde_json::Value>,
    ) -> Result<ProfileRecord, MemoryError> {
        let mut record = self.record.write().await;
        if record.version != expected_version {
            return Err(MemoryError::VersionConflict {
                expected: expected_version,
                actual: record.version,
            });
        }
        record.data = data;
        record.version += 1;
        record.updated_at = Some(Utc::now());
        Ok(record.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session() -> SessionId {
        SessionId::from("s1")
    }

    #[tokio::test]
    async fn append_assigns_increasing_seq() {
        let log = InMemoryTurnLog::new();
        let a = log.append(&session(), ConversationTurn::user("one")).await.unwrap();
        let b = log.append(&session(), ConversationTurn::assistant("two")).await.unwrap();
        assert_eq!(a.seq, 1);
        assert_eq!(b.seq, 2);
        assert_eq!(log.count(&session()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let log = InMemoryTurnLog::new();
        log.append(&session(), ConversationTurn::user("one")).await.unwrap();
        let other = SessionId::from("s2");
        let first = log.append(&other, ConversationTurn::user("hi")).await.unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(log.read(&other, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn read_limit_returns_tail_in_order() {
        let log = InMemoryTurnLog::new();
        for i in 0..5 {
            log.append(&session(), ConversationTurn::user(format!("m{i}"))).await.unwrap();
        }
        let tail = log.read(&session(), Some(2)).await.unwrap();
        let contents: Vec<&str> = tail.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m4"]);

        let after = log.read_after(&session(), 3).await.unwrap();
        assert_eq!(after.len(), 2);
        assert_eq!(after[0].seq, 4);
    }

    #[tokio::test]
    async fn unknown_session_reads_empty() {
        let log = InMemoryTurnLog::new();
        assert!(log.read(&session(), None).await.unwrap().is_empty());
        assert_eq!(log.count(&session()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn facts_limit_keeps_most_recent() {
        let store = InMemoryLongTermStore::new();
        store
            .add_facts(
                &session(),
                vec![SemanticFact::new("a"), SemanticFact::new("b"), SemanticFact::new("c")],
            )
            .await
            .unwrap();
        let facts = store.facts(&session(), 2).await.unwrap();
        assert_eq!(facts.iter().map(|f| f.text.as_str()).collect::<Vec<_>>(), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn patterns_accumulate_frequency() {
        let store = InMemoryLongTermStore::new();
        let now = Utc::now();
        store
            .record_patterns(&session(), &["asks_questions".into()], now)
            .await
            .unwrap();
        let updated = store
            .record_patterns(&session(), &["asks_questions".into(), "discusses_code".into()], now)
            .await
            .unwrap();
        assert_eq!(updated[0].frequency, 2);
        assert_eq!(updated[1].frequency, 1);

        let all = store.patterns(&session()).await.unwrap();
        assert_eq!(all[0].name, "asks_questions");
    }

    #[tokio::test]
    async fn watermark_never_moves_backwards() {
        let store = InMemoryLongTermStore::new();
        assert_eq!(store.watermark(&session(), MemoryKind::Semantic).await.unwrap(), 0);
        store.set_watermark(&session(), MemoryKind::Semantic, 7).await.unwrap();
        store.set_watermark(&session(), MemoryKind::Semantic, 3).await.unwrap();
        assert_eq!(store.watermark(&session(), MemoryKind::Semantic).await.unwrap(), 7);
        assert_eq!(store.watermark(&session(), MemoryKind::Episodic).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn clearing_a_log_restarts_its_sequence() {
        let log = InMemoryTurnLog::new();
        let other = SessionId::from("s2");
        log.append(&session(), ConversationTurn::user("one")).await.unwrap();
        log.append(&session(), ConversationTurn::user("two")).await.unwrap();
        log.append(&other, ConversationTurn::user("kept")).await.unwrap();

        assert_eq!(log.clear(&session()).await.unwrap(), 2);
        assert_eq!(log.count(&session()).await.unwrap(), 0);
        assert_eq!(log.count(&other).await.unwrap(), 1);
        let next = log.append(&session(), ConversationTurn::user("again")).await.unwrap();
        assert_eq!(next.seq, 1);
    }

    #[tokio::test]
    async fn search_ranks_by_keyword_overlap() {
        let store = InMemoryLongTermStore::new();
        store
            .add_facts(
                &session(),
                vec![
                    SemanticFact::new("Lives in Porto"),
                    SemanticFact::new("Writes Rust at work"),
                    SemanticFact::new("Prefers Rust over Go for work tools"),
                ],
            )
            .await
            .unwrap();

        let hits = store.search_facts(&session(), "rust work", 5).await.unwrap();
        let texts: Vec<&str> = hits.iter().map(|m| m.fact.text.as_str()).collect();
        // Equal scores: newer fact first.
        assert_eq!(texts, vec!["Prefers Rust over Go for work tools", "Writes Rust at work"]);
        assert_eq!(hits[0].score, 1.0);

        let one = store.search_facts(&session(), "porto rust", 1).await.unwrap();
        assert_eq!(one.len(), 1);
        assert!(store.search_facts(&session(), "python", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn clear_drops_rows_and_watermarks() {
        let store = InMemoryLongTermStore::new();
        store.add_facts(&session(), vec![SemanticFact::new("a")]).await.unwrap();
        store
            .record_patterns(&session(), &["greets".into()], Utc::now())
            .await
            .unwrap();
        store.set_watermark(&session(), MemoryKind::Semantic, 4).await.unwrap();
        assert_eq!(
            store.counts(&session()).await.unwrap(),
            LongTermCounts {
                facts: 1,
                episodes: 0,
                patterns: 1
            }
        );

        store.clear(&session()).await.unwrap();
        assert_eq!(store.counts(&session()).await.unwrap(), LongTermCounts::default());
        assert_eq!(store.watermark(&session(), MemoryKind::Semantic).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn profile_cas_bumps_version() {
        let store = InMemoryProfileStore::new();
        let mut data = serde_json::Map::new();
        data.insert("name".into(), json!("Ada"));
        let record = store.compare_and_swap(0, data.clone()).await.unwrap();
        assert_eq!(record.version, 1);

        let err = store.compare_and_swap(0, data).await.unwrap_err();
        assert!(matches!(err, MemoryError::VersionConflict { expected: 0, actual: 1 }));
        assert_eq!(store.load().await.unwrap().data["name"], "Ada");
    }
}
