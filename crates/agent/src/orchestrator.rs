//! Turn orchestration: the entry point the calling layer uses.
//!
//! One `run` call handles one user turn end to end: record the message,
//! gather short-term, long-term and retrieved context, assemble it under the
//! token budget, drive the agent loop and persist what happened.

use std::future::Future;
use std::sync::Arc;

use contextloop_config::{
    AppConfig, ContextConfig, LongTermConfig, MemoryConfig, ProviderSettings, RagConfig, ToolConfig,
};
use contextloop_core::agent::AgentTrace;
use contextloop_core::error::Error;
use chrono::{DateTime, Utc};
use contextloop_core::memory::{FactMatch, LongTermStore, ProfileRecord, ProfileStore, TurnLog};
use contextloop_core::message::{ConversationTurn, Message, SessionId};
use contextloop_core::provider::Provider;
use contextloop_core::retrieval::{RetrievedPassage, Retriever};
use contextloop_core::tool::ToolRegistry;
use contextloop_memory::{
    ExtractionReport, InMemoryLongTermStore, InMemoryProfileStore, InMemoryTurnLog, LongTermExtractor,
    RetentionPolicy, ShortTermStore, render_transcript,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::sources::{self, LongTermSnapshot};
use crate::context::token::{TokenCounter, counter_for};
use crate::context::{AssembledContext, ContextBuilder, ContextInputs, ContextSection};
use crate::loop_runner::AgentLoop;

/// What the calling layer gets back for a turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnResponse {
    pub final_answer: String,
    pub assembled_context: AssembledContext,
    pub agent_trace: AgentTrace,
    /// Retrieved passages that made it into the context.
    pub rag_sources: Vec<RetrievedPassage>,
}

/// Memory usage of one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryStats {
    pub session_id: SessionId,
    pub message_count: usize,
    /// Tokens in the rendered transcript, by the builder's counter.
    pub token_count: usize,
    pub semantic_facts_count: usize,
    pub episodes_count: usize,
    pub patterns_count: usize,
    /// Top-level keys of the global profile.
    pub profile_attributes_count: usize,
    pub oldest_message: Option<DateTime<Utc>>,
    pub newest_message: Option<DateTime<Utc>>,
}

/// Wires the stores, retriever, tools and LLM together for each turn.
pub struct TurnOrchestrator {
    provider: Option<Arc<dyn Provider>>,
    settings: ProviderSettings,
    short_term: ShortTermStore,
    long_term: Arc<dyn LongTermStore>,
    profiles: Arc<dyn ProfileStore>,
    retriever: Option<Arc<dyn Retriever>>,
    tools: Arc<ToolRegistry>,
    builder: ContextBuilder,
    context: ContextConfig,
    extraction: LongTermConfig,
}

/// Builder for [`TurnOrchestrator`]. Stores default to in-memory ones.
pub struct TurnOrchestratorBuilder {
    provider: Option<Arc<dyn Provider>>,
    settings: ProviderSettings,
    turn_log: Option<Arc<dyn TurnLog>>,
    long_term: Option<Arc<dyn LongTermStore>>,
    profiles: Option<Arc<dyn ProfileStore>>,
    retriever: Option<Arc<dyn Retriever>>,
    tools: Arc<ToolRegistry>,
    context: ContextConfig,
    counter: Option<Arc<dyn TokenCounter>>,
    summary_model: Option<String>,
    extraction: LongTermConfig,
}

impl TurnOrchestratorBuilder {
    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_provider_settings(mut self, settings: ProviderSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_turn_log(mut self, log: Arc<dyn TurnLog>) -> Self {
        self.turn_log = Some(log);
        self
    }

    pub fn with_long_term_store(mut self, store: Arc<dyn LongTermStore>) -> Self {
        self.long_term = Some(store);
        self
    }

    pub fn with_profile_store(mut self, store: Arc<dyn ProfileStore>) -> Self {
        self.profiles = Some(store);
        self
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn with_tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_context_config(mut self, context: ContextConfig) -> Self {
        self.context = context;
        self
    }

    /// Override the counter chosen from `tokenizer_path`.
    pub fn with_token_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.counter = Some(counter);
        self
    }

    pub fn with_summary_model(mut self, model: impl Into<String>) -> Self {
        self.summary_model = Some(model.into());
        self
    }

    pub fn with_extraction_config(mut self, config: LongTermConfig) -> Self {
        self.extraction = config;
        self
    }

    /// Fails only when a configured tokenizer cannot be loaded.
    pub fn build(self) -> Result<TurnOrchestrator, Error> {
        let counter = match self.counter {
            Some(counter) => counter,
            None => counter_for(&self.context)?,
        };

        let log = self.turn_log.unwrap_or_else(|| Arc::new(InMemoryTurnLog::new()));
        let mut short_term = ShortTermStore::new(log);
        if let Some(provider) = &self.provider {
            let model = self.summary_model.unwrap_or_else(|| self.settings.model.clone());
            short_term = short_term.with_summarizer(provider.clone(), model);
        }

        Ok(TurnOrchestrator {
            provider: self.provider,
            settings: self.settings,
            short_term,
            long_term: self.long_term.unwrap_or_else(|| Arc::new(InMemoryLongTermStore::new())),
            profiles: self.profiles.unwrap_or_else(|| Arc::new(InMemoryProfileStore::new())),
            retriever: self.retriever,
            tools: self.tools,
            builder: ContextBuilder::new(counter),
            context: self.context,
            extraction: self.extraction,
        })
    }
}

impl TurnOrchestrator {
    pub fn builder() -> TurnOrchestratorBuilder {
        TurnOrchestratorBuilder {
            provider: None,
            settings: ProviderSettings::default(),
            turn_log: None,
            long_term: None,
            profiles: None,
            retriever: None,
            tools: Arc::new(ToolRegistry::new()),
            context: ContextConfig::default(),
            counter: None,
            summary_model: None,
            extraction: LongTermConfig::default(),
        }
    }

    /// A builder preloaded with the provider, context and memory settings of `config`.
    pub fn from_config(config: &AppConfig) -> TurnOrchestratorBuilder {
        let mut builder = Self::builder()
            .with_provider_settings(config.provider.clone())
            .with_context_config(config.context.clone())
            .with_extraction_config(config.memory.long_term.clone());
        if let Some(model) = &config.memory.summary_model {
            builder = builder.with_summary_model(model.clone());
        }
        builder
    }

    /// Handle one user turn.
    pub async fn run(
        &self,
        session: &SessionId,
        user_message: &str,
        memory: &MemoryConfig,
        rag: &RagConfig,
        tools: &ToolConfig,
    ) -> Result<TurnResponse, Error> {
        self.run_with_cancel(session, user_message, memory, rag, tools, CancellationToken::new())
            .await
    }

    /// [`run`](Self::run), abandoned as soon as `cancel` fires. Turns already
    /// persisted and tool side effects already done are kept.
    pub async fn run_with_cancel(
        &self,
        session: &SessionId,
        user_message: &str,
        memory: &MemoryConfig,
        rag: &RagConfig,
        tools: &ToolConfig,
        cancel: CancellationToken,
    ) -> Result<TurnResponse, Error> {
        let provider = self
            .provider
            .clone()
            .ok_or_else(|| Error::configuration("no LLM provider configured"))?;
        let retriever = match (&self.retriever, rag.enabled) {
            (_, false) => None,
            (Some(retriever), true) => Some(retriever.clone()),
            (None, true) => return Err(Error::configuration("RAG is enabled but no retriever is configured")),
        };

        info!(session = %session, memory = memory.enabled, rag = rag.enabled, "Turn started");
        let mut warnings = Vec::new();

        let (short_term_text, long_term_sections) = if memory.enabled {
            let current = self.short_term.append(session, ConversationTurn::user(user_message)).await?;
            let view = self
                .short_term
                .read(session, None, RetentionPolicy::from_config(memory))
                .await?;
            warnings.extend(view.warnings);
            let prior: Vec<ConversationTurn> = view.turns.into_iter().filter(|t| t.id != current.id).collect();
            (render_transcript(&prior), self.long_term_sections(session, memory, &mut warnings).await)
        } else {
            (String::new(), Vec::new())
        };

        let passages = match retriever {
            Some(retriever) => {
                let retrieved =
                    cancellable(&cancel, retriever.retrieve(user_message, &rag.namespaces, rag.top_k)).await?;
                match retrieved {
                    Ok(passages) => passages.into_iter().map(RetrievedPassage::normalized).collect(),
                    Err(e) => {
                        warn!(session = %session, error = %e, "Retrieval failed, continuing without documents");
                        warnings.push(format!("retrieval failed ({e}); continuing without retrieved documents"));
                        Vec::new()
                    }
                }
            }
            None => Vec::new(),
        };

        let assemble = |tool_sections: Vec<ContextSection>| {
            self.builder.build(ContextInputs {
                short_term: &short_term_text,
                long_term: long_term_sections.clone(),
                passages: &passages,
                tool_sections,
                max_tokens: self.context.max_tokens,
                priority: self.context.priority,
            })
        };

        let initial = assemble(Vec::new());
        let messages = vec![
            Message::system(self.system_message(&initial)),
            Message::user(user_message),
        ];

        let agent = AgentLoop::from_config(provider, &self.settings, self.tools.clone(), tools);
        let outcome = agent.run(messages, &cancel).await?;

        let tool_sections: Vec<ContextSection> = outcome.trace.tool_results().map(sources::tool_result_section).collect();
        let mut assembled = if tool_sections.is_empty() {
            initial
        } else {
            let mut rebuilt = assemble(tool_sections);
            merge_warnings(&mut rebuilt.warnings, initial.warnings);
            rebuilt
        };
        if !warnings.is_empty() {
            merge_warnings(&mut warnings, std::mem::take(&mut assembled.warnings));
            assembled.warnings = warnings;
        }

        if memory.enabled {
            if tools.persist_activity {
                for invocation in outcome.trace.invocations() {
                    let turn = ConversationTurn::tool(
                        &invocation.call.tool_name,
                        &invocation.call.call_id,
                        invocation.result.content(),
                    )
                    .with_metadata("success", serde_json::Value::Bool(invocation.result.success));
                    self.short_term.append(session, turn).await?;
                }
            }
            self.short_term
                .append(session, ConversationTurn::assistant(outcome.final_answer.clone()))
                .await?;
        }

        info!(
            session = %session,
            steps = outcome.trace.steps.len(),
            status = ?outcome.trace.status,
            context_tokens = assembled.total_tokens,
            truncated = assembled.truncated,
            "Turn finished"
        );

        Ok(TurnResponse {
            final_answer: outcome.final_answer,
            rag_sources: assembled.passages.clone(),
            assembled_context: assembled,
            agent_trace: outcome.trace,
        })
    }

    /// Run long-term extraction for a session.
    pub async fn extract(&self, session: &SessionId, incremental: bool) -> Result<ExtractionReport, Error> {
        let provider = self
            .provider
            .clone()
            .ok_or_else(|| Error::configuration("no LLM provider configured"))?;
        let extractor = LongTermExtractor::new(
            provider,
            self.settings.model.clone(),
            self.short_term.log().clone(),
            self.long_term.clone(),
            self.profiles.clone(),
        )
        .with_config(self.extraction.clone());
        Ok(extractor.extract(session, incremental).await)
    }

    /// The global profile record.
    pub async fn profile(&self) -> Result<ProfileRecord, Error> {
        Ok(self.profiles.load().await?)
    }

    /// The raw turn log of a session, oldest first.
    pub async fn history(&self, session: &SessionId) -> Result<Vec<ConversationTurn>, Error> {
        Ok(self.short_term.log().read(session, None).await?)
    }

    pub async fn stats(&self, session: &SessionId) -> Result<MemoryStats, Error> {
        let turns = self.short_term.log().read(session, None).await?;
        let counts = self.long_term.counts(session).await?;
        let profile = self.profiles.load().await?;
        Ok(MemoryStats {
            session_id: session.clone(),
            message_count: turns.len(),
            token_count: self.builder.counter().count(&render_transcript(&turns)),
            semantic_facts_count: counts.facts,
            episodes_count: counts.episodes,
            patterns_count: counts.patterns,
            profile_attributes_count: profile.data.len(),
            oldest_message: turns.first().map(|t| t.timestamp),
            newest_message: turns.last().map(|t| t.timestamp),
        })
    }

    /// Forget a session: its turns, digest, long-term rows and watermarks.
    /// The profile is global and survives. Returns the number of turns removed.
    pub async fn reset(&self, session: &SessionId) -> Result<usize, Error> {
        let removed = self.short_term.clear(session).await?;
        self.long_term.clear(session).await?;
        info!(session = %session, removed, "Session reset");
        Ok(removed)
    }

    /// Stored facts of a session ranked by keyword overlap with `query`.
    pub async fn search_facts(&self, session: &SessionId, query: &str, limit: usize) -> Result<Vec<FactMatch>, Error> {
        let matches = self.long_term.search_facts(session, query, limit).await?;
        debug!(session = %session, query, hits = matches.len(), "Fact search");
        Ok(matches)
    }

    async fn long_term_sections(
        &self,
        session: &SessionId,
        memory: &MemoryConfig,
        warnings: &mut Vec<String>,
    ) -> Vec<ContextSection> {
        let kinds = memory.included_kinds();
        if kinds.is_empty() {
            return Vec::new();
        }
        match LongTermSnapshot::load(session, &kinds, self.long_term.as_ref(), self.profiles.as_ref()).await {
            Ok(snapshot) => snapshot.sections(),
            Err(e) => {
                warn!(session = %session, error = %e, "Failed to load long-term memory");
                warnings.push(format!("long-term memory unavailable ({e})"));
                Vec::new()
            }
        }
    }

    fn system_message(&self, context: &AssembledContext) -> String {
        if context.is_empty() {
            self.context.system_prompt.clone()
        } else {
            format!("{}\n\n{}", self.context.system_prompt, context.render())
        }
    }
}

/// Append warnings from `extra` that `into` does not already hold.
fn merge_warnings(into: &mut Vec<String>, extra: Vec<String>) {
    for warning in extra {
        if !into.contains(&warning) {
            into.push(warning);
        }
    }
}

async fn cancellable<F: Future>(cancel: &CancellationToken, future: F) -> Result<F::Output, Error> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        output = future => Ok(output),
    }
}
