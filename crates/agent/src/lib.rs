//! The contextloop engine: context assembly and the bounded agent loop.
//!
//! A turn follows a **Gather → Assemble → Act** cycle:
//!
//! 1. **Gather** short-term turns, long-term memory and retrieved passages
//! 2. **Assemble** them into one token-bounded context document
//! 3. **Send to LLM** with the registered tools
//! 4. **If tool calls**: execute them concurrently, append results in request order, loop back to step 3
//! 5. **If text response**: persist the turn and return the answer with its trace
//!
//! The loop stops when the model answers without tool calls or the step
//! limit is reached.

pub mod context;
pub mod loop_runner;
pub mod orchestrator;

#[cfg(test)]
mod test_helpers;

pub use context::{
    ApproxTokenCounter, AssembledContext, ContextBuilder, ContextInputs, ContextSection, DroppedSection,
    LongTermSnapshot, SectionGroup, SectionKind, TokenCounter, counter_for,
};
#[cfg(feature = "hf-tokenizer")]
pub use context::HfTokenCounter;
pub use loop_runner::{ABORT_FALLBACK, AgentLoop, AgentOutcome};
pub use orchestrator::{MemoryStats, TurnOrchestrator, TurnOrchestratorBuilder, TurnResponse};
