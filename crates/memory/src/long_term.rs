//! Long-term extraction: facts, episodes, profile and patterns from turns.
//!
//! The four sub-tasks are independent LLM calls run concurrently. Each one
//! either parses and stores its whole result or leaves stored state untouched
//! and reports an [`ExtractionError`]. The watermark moves only after the
//! store write; if that last step fails the stored result stands and the
//! report carries a note.

use chrono::Utc;
use contextloop_config::LongTermConfig;
use contextloop_core::error::ExtractionError;
use contextloop_core::memory::{
    EpisodicSummary, LongTermStore, MemoryKind, ProceduralPattern, ProfileStore, SemanticFact, TurnLog,
};
use contextloop_core::message::{ConversationTurn, Message, Role, SessionId};
use contextloop_core::provider::{Provider, ProviderRequest};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::profile::{DELETE_SENTINEL, apply_profile_patch, known_fields_prompt};
use crate::short_term::render_transcript;

/// How many trailing turns each sub-task looks at.
fn input_cap(kind: MemoryKind) -> usize {
    match kind {
        MemoryKind::Semantic => 20,
        MemoryKind::Episodic => 20,
        MemoryKind::Profile => 50,
        MemoryKind::Procedural => 100,
    }
}

pub(crate) fn system_prompt(kind: MemoryKind) -> &'static str {
    match kind {
        MemoryKind::Semantic => {
            "You extract durable facts from conversations. Reply with a JSON array only. \
             Each element is either a string or an object {\"text\": string, \"confidence\": number between 0 and 1}. \
             Include only facts worth remembering across conversations. Reply [] if there are none."
        }
        MemoryKind::Episodic => {
            "You write episodic memory. Reply with a JSON object only: {\"summary\": string}. \
             The summary is 2-3 sentences describing what happened in the conversation, in chronological order."
        }
        MemoryKind::Profile => {
            "You maintain a user profile. Reply with a JSON object only, containing just the fields \
             that the conversation establishes or changes. You may add fields beyond the known ones. \
             To remove a field that is no longer true, set it to {\"$delete\": true}. Reply {} if nothing applies."
        }
        MemoryKind::Procedural => {
            "You detect recurring interaction patterns (habits in how the user interacts, not facts). \
             Reply with a JSON array only, of short snake_case pattern names such as \"asks_follow_up_questions\". \
             Reply [] if there are none."
        }
    }
}

/// Everything one extraction pass produced.
#[derive(Debug, Clone, Default)]
pub struct ExtractionReport {
    pub facts: Vec<SemanticFact>,
    pub episode: Option<EpisodicSummary>,
    /// The patch merged into the global profile, if the profile task ran.
    pub profile_patch: Option<Map<String, Value>>,
    /// Profile version after the merge.
    pub profile_version: Option<u64>,
    pub patterns: Vec<ProceduralPattern>,
    /// Sub-tasks that were discarded, one entry each.
    pub failures: Vec<ExtractionError>,
    /// Sub-tasks that had nothing to do (disabled or no new turns).
    pub skipped: Vec<MemoryKind>,
    /// Sub-tasks whose results were stored but whose watermark did not move.
    /// Their turns are offered again on the next incremental run.
    pub notes: Vec<String>,
}

enum Outcome<T> {
    Skipped,
    /// Stored, with a note when the watermark could not be moved.
    Done(T, Option<String>),
    Failed(ExtractionError),
}

/// The turns one sub-task reads, and the seq its watermark moves to on success.
struct Batch {
    turns: Vec<ConversationTurn>,
    through: u64,
}

/// Derives long-term memory from a session's turn log.
pub struct LongTermExtractor {
    provider: Arc<dyn Provider>,
    model: String,
    log: Arc<dyn TurnLog>,
    store: Arc<dyn LongTermStore>,
    profiles: Arc<dyn ProfileStore>,
    config: LongTermConfig,
}

impl LongTermExtractor {
    pub fn new(
        provider: Arc<dyn Provider>,
        model: impl Into<String>,
        log: Arc<dyn TurnLog>,
        store: Arc<dyn LongTermStore>,
        profiles: Arc<dyn ProfileStore>,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            log,
            store,
            profiles,
            config: LongTermConfig::default(),
        }
    }

    pub fn with_config(mut self, config: LongTermConfig) -> Self {
        if let Some(model) = &config.model {
            self.model = model.clone();
        }
        self.config = config;
        self
    }

    /// Run every enabled sub-task for `session`.
    ///
    /// With `incremental`, each sub-task only sees turns past its own
    /// watermark. Failures are reported in the result, never raised.
    pub async fn extract(&self, session: &SessionId, incremental: bool) -> ExtractionReport {
        let (semantic, episodic, profile, procedural) = tokio::join!(
            self.extract_facts(session, incremental),
            self.extract_episode(session, incremental),
            self.extract_profile(session, incremental),
            self.extract_patterns(session, incremental),
        );

        let mut report = ExtractionReport::default();
        match semantic {
            Outcome::Done(facts, note) => {
                report.facts = facts;
                report.notes.extend(note);
            }
            Outcome::Skipped => report.skipped.push(MemoryKind::Semantic),
            Outcome::Failed(e) => report.failures.push(e),
        }
        match episodic {
            Outcome::Done(episode, note) => {
                report.episode = Some(episode);
                report.notes.extend(note);
            }
            Outcome::Skipped => report.skipped.push(MemoryKind::Episodic),
            Outcome::Failed(e) => report.failures.push(e),
        }
        match profile {
            Outcome::Done((patch, version), note) => {
                report.profile_patch = Some(patch);
                report.profile_version = Some(version);
                report.notes.extend(note);
            }
            Outcome::Skipped => report.skipped.push(MemoryKind::Profile),
            Outcome::Failed(e) => report.failures.push(e),
        }
        match procedural {
            Outcome::Done(patterns, note) => {
                report.patterns = patterns;
                report.notes.extend(note);
            }
            Outcome::Skipped => report.skipped.push(MemoryKind::Procedural),
            Outcome::Failed(e) => report.failures.push(e),
        }

        for failure in &report.failures {
            warn!(session = %session, error = %failure, "Extraction sub-task discarded");
        }
        info!(
            session = %session,
            facts = report.facts.len(),
            episode = report.episode.is_some(),
            profile_version = ?report.profile_version,
            patterns = report.patterns.len(),
            failures = report.failures.len(),
            "Long-term extraction finished"
        );
        report
    }

    /// Input turns for one sub-task, or `None` when there is nothing to do.
    ///
    /// Incremental runs take the oldest `cap` turns past the watermark, so a
    /// backlog longer than the cap is worked off over several runs. Full runs
    /// take the newest `cap` turns.
    async fn input(
        &self,
        session: &SessionId,
        kind: MemoryKind,
        incremental: bool,
    ) -> Result<Option<Batch>, ExtractionError> {
        if !self.config.is_enabled(kind) {
            return Ok(None);
        }
        let store_err = |e: contextloop_core::error::MemoryError| store_error(kind, e);

        let cap = input_cap(kind);
        let mut turns = if incremental {
            let mark = self.store.watermark(session, kind).await.map_err(store_err)?;
            let mut turns = self.log.read_after(session, mark).await.map_err(store_err)?;
            turns.truncate(cap);
            turns
        } else {
            self.log.read(session, Some(cap)).await.map_err(store_err)?
        };
        let through = turns.iter().map(|t| t.seq).max().unwrap_or(0);
        turns.retain(|t| t.role != Role::System);

        if turns.is_empty() {
            if incremental && through > 0 {
                // Only system turns: nothing to learn, but don't re-read them.
                self.store
                    .set_watermark(session, kind, through)
                    .await
                    .map_err(store_err)?;
            }
            debug!(session = %session, kind = %kind, "No new turns to extract from");
            return Ok(None);
        }
        Ok(Some(Batch { turns, through }))
    }

    async fn ask(&self, kind: MemoryKind, user_prompt: String) -> Result<Value, ExtractionError> {
        let request = ProviderRequest::new(
            self.model.clone(),
            vec![Message::system(system_prompt(kind)), Message::user(user_prompt)],
        )
        .with_temperature(0.2);

        let response = self.provider.complete(request).await.map_err(|source| ExtractionError::Llm {
            kind: kind.to_string(),
            source,
        })?;
        parse_json(kind, response.text())
    }

    /// Turn a sub-task result into an outcome, moving the watermark to
    /// `through` on success.
    async fn settle<T>(
        &self,
        session: &SessionId,
        kind: MemoryKind,
        through: u64,
        result: Result<T, ExtractionError>,
    ) -> Outcome<T> {
        let value = match result {
            Ok(value) => value,
            Err(e) => return Outcome::Failed(e),
        };
        match self.store.set_watermark(session, kind, through).await {
            Ok(()) => Outcome::Done(value, None),
            Err(e) => {
                warn!(session = %session, kind = %kind, error = %e, "Stored extraction but could not advance watermark");
                Outcome::Done(
                    value,
                    Some(format!("{kind}: results stored, watermark not advanced ({e})")),
                )
            }
        }
    }

    async fn extract_facts(&self, session: &SessionId, incremental: bool) -> Outcome<Vec<SemanticFact>> {
        let kind = MemoryKind::Semantic;
        let Batch { turns, through } = match self.input(session, kind, incremental).await {
            Ok(Some(batch)) => batch,
            Ok(None) => return Outcome::Skipped,
            Err(e) => return Outcome::Failed(e),
        };

        let prompt = format!("Conversation:\n{}", render_transcript(&turns));
        let result = async {
            let value = self.ask(kind, prompt).await?;
            let mut facts = parse_facts(&value)?;
            for fact in &mut facts {
                fact.source = Some(format!("session:{session}"));
            }
            if !facts.is_empty() {
                self.store
                    .add_facts(session, facts.clone())
                    .await
                    .map_err(|e| store_error(kind, e))?;
            }
            Ok::<_, ExtractionError>(facts)
        }
        .await;
        self.settle(session, kind, through, result).await
    }

    async fn extract_episode(&self, session: &SessionId, incremental: bool) -> Outcome<EpisodicSummary> {
        let kind = MemoryKind::Episodic;
        let Batch { turns, through } = match self.input(session, kind, incremental).await {
            Ok(Some(batch)) => batch,
            Ok(None) => return Outcome::Skipped,
            Err(e) => return Outcome::Failed(e),
        };

        let timeline = turns
            .iter()
            .map(|t| format!("[{}] {}: {}", t.timestamp.format("%H:%M"), t.role, t.content))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!("Conversation:\n{timeline}");

        let result = async {
            let value = self.ask(kind, prompt).await?;
            let summary = value
                .get("summary")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| malformed(kind, "expected an object with a non-empty \"summary\" string"))?;

            let episode = EpisodicSummary {
                id: Uuid::new_v4().to_string(),
                start: turns[0].timestamp,
                end: turns[turns.len() - 1].timestamp,
                summary: summary.to_string(),
                created_at: Utc::now(),
            };
            self.store
                .add_episode(session, episode.clone())
                .await
                .map_err(|e| store_error(kind, e))?;
            Ok::<_, ExtractionError>(episode)
        }
        .await;
        self.settle(session, kind, through, result).await
    }

    async fn extract_profile(&self, session: &SessionId, incremental: bool) -> Outcome<(Map<String, Value>, u64)> {
        let kind = MemoryKind::Profile;
        let Batch { turns, through } = match self.input(session, kind, incremental).await {
            Ok(Some(batch)) => batch,
            Ok(None) => return Outcome::Skipped,
            Err(e) => return Outcome::Failed(e),
        };

        let result = async {
            let current = self.profiles.load().await.map_err(|e| store_error(kind, e))?;
            let prompt = format!(
                "Known fields (not exhaustive):\n{}\n\nCurrent profile:\n{}\n\nConversation:\n{}",
                known_fields_prompt(),
                Value::Object(current.data),
                render_transcript(&turns),
            );
            let value = self.ask(kind, prompt).await?;
            let Value::Object(patch) = value else {
                return Err(malformed(kind, "expected a JSON object"));
            };
            validate_sentinels(&patch).map_err(|reason| malformed(kind, &reason))?;

            let record = apply_profile_patch(self.profiles.as_ref(), &patch)
                .await
                .map_err(|e| store_error(kind, e))?;
            Ok::<_, ExtractionError>((patch, record.version))
        }
        .await;
        self.settle(session, kind, through, result).await
    }

    async fn extract_patterns(&self, session: &SessionId, incremental: bool) -> Outcome<Vec<ProceduralPattern>> {
        let kind = MemoryKind::Procedural;
        let Batch { turns, through } = match self.input(session, kind, incremental).await {
            Ok(Some(batch)) => batch,
            Ok(None) => return Outcome::Skipped,
            Err(e) => return Outcome::Failed(e),
        };

        let signals = interaction_signals(&turns);
        let prompt = format!(
            "Observed signals: {}\n\nConversation:\n{}",
            if signals.is_empty() { "none".to_string() } else { signals.join(", ") },
            render_transcript(&turns),
        );

        let result = async {
            let value = self.ask(kind, prompt).await?;
            let names = parse_pattern_names(&value)?;
            let patterns = if names.is_empty() {
                Vec::new()
            } else {
                self.store
                    .record_patterns(session, &names, Utc::now())
                    .await
                    .map_err(|e| store_error(kind, e))?
            };
            Ok::<_, ExtractionError>(patterns)
        }
        .await;
        self.settle(session, kind, through, result).await
    }
}

fn malformed(kind: MemoryKind, reason: &str) -> ExtractionError {
    ExtractionError::Malformed {
        kind: kind.to_string(),
        reason: reason.to_string(),
    }
}

fn store_error(kind: MemoryKind, e: contextloop_core::error::MemoryError) -> ExtractionError {
    ExtractionError::Store {
        kind: kind.to_string(),
        reason: e.to_string(),
    }
}

/// Strip an optional markdown code fence and parse JSON.
fn parse_json(kind: MemoryKind, raw: &str) -> Result<Value, ExtractionError> {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```") {
        // Drop the fence line, including an optional language tag.
        text = rest.split_once('\n').map_or("", |(_, body)| body);
        text = text.trim_end().strip_suffix("```").unwrap_or(text).trim();
    }
    serde_json::from_str(text).map_err(|e| malformed(kind, &format!("invalid JSON: {e}")))
}

fn parse_facts(value: &Value) -> Result<Vec<SemanticFact>, ExtractionError> {
    let kind = MemoryKind::Semantic;
    let items = value.as_array().ok_or_else(|| malformed(kind, "expected a JSON array"))?;

    let mut facts = Vec::with_capacity(items.len());
    for item in items {
        let (text, confidence) = match item {
            Value::String(s) => (s.as_str(), None),
            Value::Object(o) => {
                let text = o
                    .get("text")
                    .and_then(Value::as_str)
                    .ok_or_else(|| malformed(kind, "fact object without a \"text\" string"))?;
                let confidence = match o.get("confidence") {
                    None | Some(Value::Null) => None,
                    Some(c) => Some(
                        c.as_f64()
                            .filter(|c| (0.0..=1.0).contains(c))
                            .ok_or_else(|| malformed(kind, "confidence must be a number in [0, 1]"))?
                            as f32,
                    ),
                };
                (text, confidence)
            }
            _ => return Err(malformed(kind, "facts must be strings or objects")),
        };
        let text = text.trim();
        if text.is_empty() {
            continue;
        }
        let mut fact = SemanticFact::new(text);
        fact.confidence = confidence;
        facts.push(fact);
    }
    Ok(facts)
}

fn parse_pattern_names(value: &Value) -> Result<Vec<String>, ExtractionError> {
    let kind = MemoryKind::Procedural;
    let items = value.as_array().ok_or_else(|| malformed(kind, "expected a JSON array"))?;

    let mut names: Vec<String> = Vec::new();
    for item in items {
        let raw = match item {
            Value::String(s) => s.as_str(),
            Value::Object(o) => o
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| malformed(kind, "pattern object without a \"name\" string"))?,
            _ => return Err(malformed(kind, "patterns must be strings or objects")),
        };
        let name = normalize_pattern_name(raw);
        if !name.is_empty() && !names.contains(&name) {
            names.push(name);
        }
    }
    Ok(names)
}

fn normalize_pattern_name(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

/// Reject sentinel objects that carry anything other than `"$delete": true`.
fn validate_sentinels(patch: &Map<String, Value>) -> Result<(), String> {
    for (key, value) in patch {
        if let Value::Object(nested) = value {
            if let Some(flag) = nested.get(DELETE_SENTINEL) {
                if nested.len() != 1 || flag != &Value::Bool(true) {
                    return Err(format!("malformed delete sentinel for \"{key}\""));
                }
            } else {
                validate_sentinels(nested)?;
            }
        }
    }
    Ok(())
}

/// Cheap local signals handed to the pattern model as hints.
fn interaction_signals(turns: &[ConversationTurn]) -> Vec<String> {
    let user: Vec<&ConversationTurn> = turns.iter().filter(|t| t.role == Role::User).collect();
    if user.is_empty() {
        return Vec::new();
    }

    let mut signals = Vec::new();
    let questions = user.iter().filter(|t| t.content.contains('?')).count();
    if questions * 2 > user.len() {
        signals.push(format!("{questions} of {} user messages are questions", user.len()));
    }

    const GREETINGS: [&str; 5] = ["hello", "hi ", "hey", "good morning", "thanks"];
    if user.iter().any(|t| {
        let lower = t.content.to_lowercase();
        GREETINGS.iter().any(|g| lower.starts_with(g) || lower.contains(&format!(" {g}")))
    }) {
        signals.push("uses greetings or thanks".into());
    }

    const CODE_MARKERS: [&str; 5] = ["```", "fn ", "def ", "class ", "function"];
    if user.iter().any(|t| CODE_MARKERS.iter().any(|m| t.content.contains(m))) {
        signals.push("discusses code".into());
    }
    signals
}
