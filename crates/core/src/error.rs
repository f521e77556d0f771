//! Error types for the contextloop domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.
//!
//! Only [`Error`] is ever surfaced to the caller of a turn. Tool failures,
//! extraction failures and budget overruns are recovered locally and travel
//! as data (`ToolResult`, `ExtractionReport::failures`, context warnings).

use thiserror::Error;

/// The top-level error type for all contextloop operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Memory errors ---
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Retrieval errors ---
    #[error("Retrieval error: {0}")]
    Retrieval(#[from] RetrievalError),

    /// A required collaborator (LLM, retriever, store) is unavailable.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// The caller cancelled the turn.
    #[error("Turn cancelled by caller")]
    Cancelled,
}

impl Error {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Malformed provider response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Storage error: {0}")]
    Storage(String),

    /// Optimistic concurrency check on the profile record failed.
    #[error("Profile version conflict: expected {expected}, found {actual}")]
    VersionConflict { expected: u64, actual: u64 },

    #[error("Summarization failed: {0}")]
    Summarization(String),
}

/// Tool failures. These never leave the agent loop as errors; the registry
/// converts them into unsuccessful `ToolResult`s.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),

    #[error("tool {tool_name} failed: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("tool {tool_name} timed out after {timeout_ms}ms")]
    Timeout { tool_name: String, timeout_ms: u64 },

    #[error("invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("tool {0} is already registered")]
    Duplicate(String),

    #[error("tool {0} cancelled")]
    Cancelled(String),
}

/// Failure of one long-term extraction sub-task.
#[derive(Debug, Clone, Error)]
pub enum ExtractionError {
    #[error("{kind} extraction returned malformed output: {reason}")]
    Malformed { kind: String, reason: String },

    #[error("{kind} extraction call failed: {source}")]
    Llm {
        kind: String,
        #[source]
        source: ProviderError,
    },

    #[error("{kind} extraction could not be stored: {reason}")]
    Store { kind: String, reason: String },
}

#[derive(Debug, Clone, Error)]
pub enum RetrievalError {
    #[error("Unknown namespace: {0}")]
    UnknownNamespace(String),

    #[error("Retrieval backend failed: {0}")]
    Backend(String),
}
