//! LLM provider implementations for contextloop.
//!
//! All providers implement the `contextloop_core::Provider` trait.

pub mod openai_compat;

pub use openai_compat::OpenAiCompatProvider;
