//! Token-budgeted context assembly.
//!
//! Merges short-term conversation, long-term memory, retrieved passages and
//! this turn's tool results into one document of `## Title` sections.
//!
//! # Budget policy
//!
//! Sections are never cut: a section that does not fit is dropped whole.
//! Each source group (memory, retrieval) is filled as a prefix of its own
//! order, so the first section that does not fit ends that group. This keeps
//! inclusion monotone in the budget, which is what makes `balanced` a subset
//! of `memory ∪ rag` for every input.
//!
//! Tool results are always kept and are charged first. If they alone exceed
//! the budget everything else goes and the context is marked truncated.
//!
//! # Determinism
//!
//! Identical inputs always produce identical outputs. Score ties among
//! retrieved passages keep their input order.

use std::sync::Arc;

use contextloop_config::PriorityMode;
use contextloop_core::retrieval::RetrievedPassage;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::sources;
use super::token::TokenCounter;

// ── Types ─────────────────────────────────────────────────────────────────

/// What a section holds. Determines its group and position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    RecentConversation,
    UserProfile,
    KnownFacts,
    ConversationSummary,
    InteractionPatterns,
    RetrievedDocument,
    ToolResult,
}

/// The budget group a section competes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionGroup {
    Memory,
    Retrieval,
    Tool,
}

impl SectionKind {
    pub fn group(self) -> SectionGroup {
        match self {
            Self::RecentConversation
            | Self::UserProfile
            | Self::KnownFacts
            | Self::ConversationSummary
            | Self::InteractionPatterns => SectionGroup::Memory,
            Self::RetrievedDocument => SectionGroup::Retrieval,
            Self::ToolResult => SectionGroup::Tool,
        }
    }

    /// Fill order inside the memory group.
    fn fill_rank(self) -> u8 {
        match self {
            Self::RecentConversation => 0,
            Self::UserProfile => 1,
            Self::KnownFacts => 2,
            Self::ConversationSummary => 3,
            Self::InteractionPatterns => 4,
            Self::RetrievedDocument | Self::ToolResult => 5,
        }
    }

    /// Position in the rendered document.
    fn layout_rank(self) -> u8 {
        match self {
            Self::RecentConversation => 0,
            Self::RetrievedDocument => 1,
            Self::KnownFacts => 2,
            Self::UserProfile => 3,
            Self::ConversationSummary => 4,
            Self::InteractionPatterns => 5,
            Self::ToolResult => 6,
        }
    }
}

/// One titled block of the assembled context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSection {
    pub kind: SectionKind,
    pub title: String,
    pub body: String,
    /// Tokens of the rendered block, heading included. Set by the builder.
    pub tokens: usize,
}

impl ContextSection {
    pub fn new(kind: SectionKind, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            kind,
            title: title.into(),
            body: body.into(),
            tokens: 0,
        }
    }

    /// The section as it appears in the document.
    pub fn render(&self) -> String {
        format!("## {}\n\n{}", self.title, self.body.trim_end())
    }

    fn is_empty(&self) -> bool {
        self.body.trim().is_empty()
    }
}

/// A section left out of the context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedSection {
    pub title: String,
    pub kind: SectionKind,
    pub tokens: usize,
}

/// Everything the builder needs for one assembly.
#[derive(Debug, Clone)]
pub struct ContextInputs<'a> {
    /// Rendered short-term transcript; empty when there is none.
    pub short_term: &'a str,
    /// Long-term memory sections, in any order.
    pub long_term: Vec<ContextSection>,
    /// Retrieved passages, in any order.
    pub passages: &'a [RetrievedPassage],
    /// Tool results committed during this turn, in trace order.
    pub tool_sections: Vec<ContextSection>,
    pub max_tokens: usize,
    pub priority: PriorityMode,
}

/// The bounded context document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssembledContext {
    /// Included sections in document order.
    pub sections: Vec<ContextSection>,
    /// Token count of [`render`](Self::render), separators included.
    pub total_tokens: usize,
    pub max_tokens: usize,
    /// True when anything was dropped or the budget was exceeded.
    pub truncated: bool,
    pub warnings: Vec<String>,
    pub dropped: Vec<DroppedSection>,
    /// Passages whose sections made it into the document, best first.
    pub passages: Vec<RetrievedPassage>,
}

/// Joins rendered sections in the document.
const SEPARATOR: &str = "\n\n";

fn render_sections(sections: &[ContextSection]) -> String {
    sections
        .iter()
        .map(ContextSection::render)
        .collect::<Vec<_>>()
        .join(SEPARATOR)
}

impl AssembledContext {
    /// The whole document, sections separated by a blank line.
    pub fn render(&self) -> String {
        render_sections(&self.sections)
    }

    pub fn section(&self, title: &str) -> Option<&ContextSection> {
        self.sections.iter().find(|s| s.title == title)
    }

    pub fn titles(&self) -> Vec<&str> {
        self.sections.iter().map(|s| s.title.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }
}

// ── Builder ───────────────────────────────────────────────────────────────

/// Assembles contexts. Stateless apart from its counter; create one and reuse it.
#[derive(Clone)]
pub struct ContextBuilder {
    counter: Arc<dyn TokenCounter>,
}


/// Result of filling one group: how many leading sections fit and their cost.
#[derive(Debug, Clone, Copy, Default)]
struct Fill {
    included: usize,
    used: usize,
}

/// Each section costs its own tokens plus one separator. `budget` already
/// carries one spare separator, since n sections need only n - 1.
fn fill_prefix(sections: &[ContextSection], budget: usize, separator: usize) -> Fill {
    let mut fill = Fill::default();
    for section in sections {
        let cost = section.tokens + separator;
        if fill.used + cost > budget {
            break;
        }
        fill.used += cost;
        fill.included += 1;
    }
    fill
}

impl ContextBuilder {
    pub fn new(counter: Arc<dyn TokenCounter>) -> Self {
        Self { counter }
    }

    pub fn counter(&self) -> &Arc<dyn TokenCounter> {
        &self.counter
    }

    fn counted(&self, mut section: ContextSection) -> ContextSection {
        section.tokens = self.counter.count(&section.render());
        section
    }

    /// Assemble a context under `inputs.max_tokens`.
    ///
    /// # Algorithm
    ///
    /// 1. Count every non-empty candidate section as rendered
    /// 2. Charge the tool sections; if they alone overflow, keep only them
    /// 3. Split the rest between memory and retrieval per the priority mode
    /// 4. Lay out the survivors in document order
    ///
    /// Never fails: overflow degrades to `truncated` plus warnings.
    pub fn build(&self, inputs: ContextInputs<'_>) -> AssembledContext {
        let budget = inputs.max_tokens;

        let mut memory: Vec<ContextSection> = std::iter::once(sources::recent_conversation(inputs.short_term))
            .chain(inputs.long_term)
            .filter(|s| !s.is_empty())
            .map(|s| self.counted(s))
            .collect();
        memory.sort_by_key(|s| s.kind.fill_rank());

        let mut ranked: Vec<&RetrievedPassage> = inputs.passages.iter().collect();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        let retrieval: Vec<ContextSection> = ranked
            .iter()
            .enumerate()
            .map(|(i, p)| sources::passage_section(i + 1, p))
            .filter(|s| !s.is_empty())
            .map(|s| self.counted(s))
            .collect();
        // Section index -> passage, kept aligned with `retrieval`.
        let retrieval_passages: Vec<&RetrievedPassage> = ranked
            .iter()
            .copied()
            .filter(|p| !p.content.trim().is_empty())
            .collect();

        // Current-turn tool results are never filtered, even when empty.
        let tools: Vec<ContextSection> = inputs.tool_sections.into_iter().map(|s| self.counted(s)).collect();
        let tool_tokens: usize = tools.iter().map(|s| s.tokens).sum();

        let separator = self.counter.count(SEPARATOR);
        // Everything below is charged with one separator per section.
        let allowance = budget + separator;
        let tool_cost = tool_tokens + separator * tools.len();

        let mut warnings = Vec::new();
        let (memory_fill, retrieval_fill) = if tool_cost > allowance {
            warn!(tool_tokens, budget, "Tool results alone exceed the context budget");
            warnings.push(format!(
                "tool results use {tool_tokens} tokens, exceeding the budget of {budget}; all other context dropped"
            ));
            (Fill::default(), Fill::default())
        } else {
            let remaining = allowance - tool_cost;
            let fill = |sections: &[ContextSection], budget| fill_prefix(sections, budget, separator);
            match inputs.priority {
                PriorityMode::Memory => {
                    let m = fill(&memory[..], remaining);
                    let r = fill(&retrieval[..], remaining - m.used);
                    (m, r)
                }
                PriorityMode::Rag => {
                    let r = fill(&retrieval[..], remaining);
                    let m = fill(&memory[..], remaining - r.used);
                    (m, r)
                }
                PriorityMode::Balanced => {
                    let first = fill(&memory[..], remaining / 2);
                    let r = fill(&retrieval[..], remaining - first.used);
                    let m = fill(&memory[..], remaining - r.used);
                    (m, r)
                }
            }
        };

        let mut dropped = Vec::new();
        for section in memory[memory_fill.included..]
            .iter()
            .chain(&retrieval[retrieval_fill.included..])
        {
            debug!(section = %section.title, tokens = section.tokens, "Dropping section");
            warnings.push(format!(
                "dropped section '{}' ({} tokens): exceeds remaining context budget",
                section.title, section.tokens
            ));
            dropped.push(DroppedSection {
                title: section.title.clone(),
                kind: section.kind,
                tokens: section.tokens,
            });
        }

        let passages = retrieval_passages[..retrieval_fill.included]
            .iter()
            .map(|p| (*p).clone())
            .collect();

        let mut sections: Vec<ContextSection> = memory
            .into_iter()
            .take(memory_fill.included)
            .chain(retrieval.into_iter().take(retrieval_fill.included))
            .chain(tools)
            .collect();
        sections.sort_by_key(|s| s.kind.layout_rank());

        let total_tokens = self.counter.count(&render_sections(&sections));
        if total_tokens > budget && tool_cost <= allowance {
            // Only a tokenizer that merges across section boundaries gets here.
            warn!(total_tokens, budget, "Rendered context exceeds the budget");
            warnings.push(format!(
                "rendered context uses {total_tokens} tokens, exceeding the budget of {budget}"
            ));
        }
        let truncated = !warnings.is_empty();

        debug!(
            sections = sections.len(),
            total_tokens,
            budget,
            dropped = dropped.len(),
            priority = ?inputs.priority,
            "Assembled context"
        );

        AssembledContext {
            sections,
            total_tokens,
            max_tokens: budget,
            truncated,
            warnings,
            dropped,
            passages,
        }
    }
}
