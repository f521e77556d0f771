//! Context assembly: token counting, section rendering and the budgeted
//! builder.
//!
//! # Sections (document order)
//!
//! | Section | Group | Source |
//! |---------|-------|--------|
//! | Recent Conversation | memory | short-term store |
//! | Retrieved Document N | retrieval | retriever, by score |
//! | Known Facts | memory | semantic memory |
//! | User Profile | memory | global profile |
//! | Conversation Summary | memory | latest episode |
//! | Interaction Patterns | memory | procedural memory |
//! | Tool Result | tool | this turn's tool calls, always kept |

pub mod builder;
pub mod sources;
pub mod token;

pub use builder::{
    AssembledContext, ContextBuilder, ContextInputs, ContextSection, DroppedSection, SectionGroup,
    SectionKind,
};
pub use sources::LongTermSnapshot;
pub use token::{ApproxTokenCounter, TokenCounter, counter_for};
#[cfg(feature = "hf-tokenizer")]
pub use token::HfTokenCounter;
