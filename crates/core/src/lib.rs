//! # contextloop core
//!
//! Domain types, collaborator traits, and error definitions for the
//! contextloop engine. This crate has **no framework dependencies**: it
//! defines the model every other crate implements against.
//!
//! ## Design Philosophy
//!
//! Every collaborator is a trait here (LLM provider, stores, retriever,
//! tools). Implementations live in their respective crates. This enables:
//! - Swapping implementations via configuration
//! - Easy testing with mock/stub implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod agent;
pub mod error;
pub mod memory;
pub mod message;
pub mod provider;
pub mod retrieval;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use agent::{AgentStep, AgentTrace, LoopState, ToolInvocation, TraceStatus};
pub use error::{Error, Result};
pub use memory::{
    EpisodicSummary, FactMatch, LongTermCounts, LongTermStore, MemoryKind, ProceduralPattern, ProfileRecord,
    ProfileStore, SemanticFact, TurnLog, keyword_score,
};
pub use message::{ConversationTurn, Message, MessageToolCall, Role, SessionId};
pub use provider::{ModelReply, Provider, ProviderRequest, ProviderResponse, ToolDefinition};
pub use retrieval::{RetrievedPassage, Retriever};
pub use tool::{Tool, ToolCall, ToolOutput, ToolRegistry, ToolResult};
