//! Memory model: short-term turn log and long-term derived memory.
//!
//! Long-term memory comes in four kinds (see [`MemoryKind`]). Facts,
//! episodes and patterns are scoped to a session; the user profile is one
//! global record guarded by a version number.
//!
//! Storage is behind traits. In-process implementations live in
//! `contextloop-memory`; durable backends plug in by implementing the same
//! traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MemoryError;
use crate::message::{ConversationTurn, SessionId};

/// The kinds of long-term memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    /// Free-standing facts about the user or world
    Semantic,
    /// Chronological digests of what happened
    Episodic,
    /// The global user profile
    Profile,
    /// Recurring interaction habits
    Procedural,
}

impl MemoryKind {
    pub const ALL: [MemoryKind; 4] = [
        MemoryKind::Semantic,
        MemoryKind::Episodic,
        MemoryKind::Profile,
        MemoryKind::Procedural,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::Semantic => "semantic",
            MemoryKind::Episodic => "episodic",
            MemoryKind::Profile => "profile",
            MemoryKind::Procedural => "procedural",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "semantic" => Some(MemoryKind::Semantic),
            "episodic" => Some(MemoryKind::Episodic),
            "profile" => Some(MemoryKind::Profile),
            "procedural" => Some(MemoryKind::Procedural),
            _ => None,
        }
    }
}

impl std::fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse stored or configured kind names. Unknown names are skipped so older
/// binaries keep working against newer data; duplicates collapse.
pub fn parse_kinds<I, S>(names: I) -> Vec<MemoryKind>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut kinds = Vec::new();
    for name in names {
        match MemoryKind::parse(name.as_ref()) {
            Some(kind) if !kinds.contains(&kind) => kinds.push(kind),
            Some(_) => {}
            None => tracing::debug!(name = name.as_ref(), "Ignoring unknown memory kind"),
        }
    }
    kinds
}

/// A single extracted fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticFact {
    pub id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    /// Where the fact came from (session or turn reference)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl SemanticFact {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            text: text.into(),
            confidence: None,
            source: None,
            created_at: Utc::now(),
        }
    }
}

/// A fact returned by a search, with its relevance in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactMatch {
    pub fact: SemanticFact,
    pub score: f32,
}

/// Lowercased alphanumeric words of `text`.
fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
}

/// Share of the distinct query words that occur in `text`.
///
/// Zero for an empty query.
pub fn keyword_score(query: &str, text: &str) -> f32 {
    let mut wanted: Vec<String> = words(query).collect();
    wanted.sort();
    wanted.dedup();
    if wanted.is_empty() {
        return 0.0;
    }
    let present: std::collections::HashSet<String> = words(text).collect();
    let hits = wanted.iter().filter(|w| present.contains(*w)).count();
    hits as f32 / wanted.len() as f32
}

/// Row counts of one session's long-term memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LongTermCounts {
    pub facts: usize,
    pub episodes: usize,
    pub patterns: usize,
}

/// A digest of a stretch of conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodicSummary {
    pub id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub summary: String,
    pub created_at: DateTime<Utc>,
}

/// A recurring interaction signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProceduralPattern {
    pub name: String,
    pub frequency: u32,
    pub last_used: DateTime<Utc>,
}

/// The global user profile: schema-less ordered JSON plus a version counter.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub data: serde_json::Map<String, serde_json::Value>,
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Per-session append-only turn log.
///
/// Implementations must publish each append atomically: a concurrent reader
/// sees either the whole turn or none of it.
#[async_trait]
pub trait TurnLog: Send + Sync {
    /// Append a turn, assigning the next sequence number. Returns the stored turn.
    async fn append(&self, session: &SessionId, turn: ConversationTurn) -> Result<ConversationTurn, MemoryError>;

    /// The last `limit` turns (all when `None`), oldest first.
    async fn read(&self, session: &SessionId, limit: Option<usize>) -> Result<Vec<ConversationTurn>, MemoryError>;

    /// Turns with `seq > after_seq`, oldest first.
    async fn read_after(&self, session: &SessionId, after_seq: u64) -> Result<Vec<ConversationTurn>, MemoryError>;

    async fn count(&self, session: &SessionId) -> Result<usize, MemoryError>;

    /// Drop every turn of the session. Returns how many were removed.
    async fn clear(&self, session: &SessionId) -> Result<usize, MemoryError>;
}

/// Per-session long-term memory rows.
#[async_trait]
pub trait LongTermStore: Send + Sync {
    async fn add_facts(&self, session: &SessionId, facts: Vec<SemanticFact>) -> Result<(), MemoryError>;

    /// The most recent `limit` facts, oldest first.
    async fn facts(&self, session: &SessionId, limit: usize) -> Result<Vec<SemanticFact>, MemoryError>;

    async fn add_episode(&self, session: &SessionId, episode: EpisodicSummary) -> Result<(), MemoryError>;

    async fn latest_episode(&self, session: &SessionId) -> Result<Option<EpisodicSummary>, MemoryError>;

    /// Record sightings of patterns: existing names get `frequency += 1`,
    /// new names start at 1. Returns the updated rows.
    async fn record_patterns(
        &self,
        session: &SessionId,
        names: &[String],
        seen_at: DateTime<Utc>,
    ) -> Result<Vec<ProceduralPattern>, MemoryError>;

    /// All patterns, most frequent first.
    async fn patterns(&self, session: &SessionId) -> Result<Vec<ProceduralPattern>, MemoryError>;

    /// Highest turn seq consumed by the given extraction kind (0 if none).
    async fn watermark(&self, session: &SessionId, kind: MemoryKind) -> Result<u64, MemoryError>;

    async fn set_watermark(&self, session: &SessionId, kind: MemoryKind, seq: u64) -> Result<(), MemoryError>;

    /// Facts matching `query` (see [`keyword_score`]), best first, at most `limit`.
    /// Facts with no matching word are left out.
    async fn search_facts(&self, session: &SessionId, query: &str, limit: usize) -> Result<Vec<FactMatch>, MemoryError>;

    async fn counts(&self, session: &SessionId) -> Result<LongTermCounts, MemoryError>;

    /// Drop the session's facts, episodes, patterns and watermarks.
    async fn clear(&self, session: &SessionId) -> Result<(), MemoryError>;
}

/// The single global profile row.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn load(&self) -> Result<ProfileRecord, MemoryError>;

    /// Replace the profile data if the stored version still equals
    /// `expected_version`, bumping the version by one. Otherwise fails with
    /// [`MemoryError::VersionConflict`].
    async fn compare_and_swap(
        &self,
        expected_version: u64,
        data: serde_json::Map<String, serde_json::Value>,
    ) -> Result<ProfileRecord, MemoryError>;
}
