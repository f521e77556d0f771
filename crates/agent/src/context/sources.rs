//! Rendering of memory, retrieval and tool data into context sections.

use contextloop_core::memory::{
    EpisodicSummary, LongTermStore, MemoryKind, ProceduralPattern, ProfileRecord, ProfileStore,
    SemanticFact,
};
use contextloop_core::error::MemoryError;
use contextloop_core::message::SessionId;
use contextloop_core::retrieval::RetrievedPassage;
use contextloop_core::tool::ToolResult;
use serde_json::Value;

use super::builder::{ContextSection, SectionKind};

/// How many stored facts a turn pulls into context.
pub const FACTS_IN_CONTEXT: usize = 20;

pub fn recent_conversation(transcript: &str) -> ContextSection {
    ContextSection::new(SectionKind::RecentConversation, "Recent Conversation", transcript)
}

pub fn profile_section(profile: &ProfileRecord) -> ContextSection {
    let body = profile
        .data
        .iter()
        .map(|(key, value)| format!("- {key}: {}", render_value(value)))
        .collect::<Vec<_>>()
        .join("\n");
    ContextSection::new(SectionKind::UserProfile, "User Profile", body)
}

pub fn facts_section(facts: &[SemanticFact]) -> ContextSection {
    let body = facts
        .iter()
        .map(|f| format!("- {}", f.text))
        .collect::<Vec<_>>()
        .join("\n");
    ContextSection::new(SectionKind::KnownFacts, "Known Facts", body)
}

pub fn episode_section(episode: &EpisodicSummary) -> ContextSection {
    let body = format!(
        "From {} to {}: {}",
        episode.start.format("%Y-%m-%d %H:%M UTC"),
        episode.end.format("%Y-%m-%d %H:%M UTC"),
        episode.summary
    );
    ContextSection::new(SectionKind::ConversationSummary, "Conversation Summary", body)
}

pub fn patterns_section(patterns: &[ProceduralPattern]) -> ContextSection {
    let body = patterns
        .iter()
        .map(|p| {
            let times = if p.frequency == 1 { "time" } else { "times" };
            format!("- {} (seen {} {times})", p.name, p.frequency)
        })
        .collect::<Vec<_>>()
        .join("\n");
    ContextSection::new(SectionKind::InteractionPatterns, "Interaction Patterns", body)
}

/// `rank` is the passage's 1-based position after score ordering.
pub fn passage_section(rank: usize, passage: &RetrievedPassage) -> ContextSection {
    ContextSection::new(
        SectionKind::RetrievedDocument,
        format!("Retrieved Document {rank} (namespace: {})", passage.namespace),
        passage.content.clone(),
    )
}

pub fn tool_result_section(result: &ToolResult) -> ContextSection {
    ContextSection::new(
        SectionKind::ToolResult,
        format!("Tool Result: {} ({})", result.tool_name, result.call_id),
        match result.content() {
            content if content.trim().is_empty() => "(no output)".to_string(),
            content => content,
        },
    )
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(render_value).collect::<Vec<_>>().join(", "),
        other => other.to_string(),
    }
}

/// Long-term memory loaded for one turn.
#[derive(Debug, Clone, Default)]
pub struct LongTermSnapshot {
    pub facts: Vec<SemanticFact>,
    pub episode: Option<EpisodicSummary>,
    pub profile: Option<ProfileRecord>,
    pub patterns: Vec<ProceduralPattern>,
}

impl LongTermSnapshot {
    /// Load the kinds in `kinds`; the rest stay empty.
    pub async fn load(
        session: &SessionId,
        kinds: &[MemoryKind],
        store: &dyn LongTermStore,
        profiles: &dyn ProfileStore,
    ) -> Result<Self, MemoryError> {
        let mut snapshot = Self::default();
        for kind in kinds {
            match kind {
                MemoryKind::Semantic => snapshot.facts = store.facts(session, FACTS_IN_CONTEXT).await?,
                MemoryKind::Episodic => snapshot.episode = store.latest_episode(session).await?,
                MemoryKind::Profile => snapshot.profile = Some(profiles.load().await?),
                MemoryKind::Procedural => snapshot.patterns = store.patterns(session).await?,
            }
        }
        Ok(snapshot)
    }

    pub fn sections(&self) -> Vec<ContextSection> {
        let mut sections = Vec::new();
        if let Some(profile) = &self.profile {
            sections.push(profile_section(profile));
        }
        if !self.facts.is_empty() {
            sections.push(facts_section(&self.facts));
        }
        if let Some(episode) = &self.episode {
            sections.push(episode_section(episode));
        }
        if !self.patterns.is_empty() {
            sections.push(patterns_section(&self.patterns));
        }
        sections
    }
}
