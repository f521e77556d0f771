//! Configuration loading, validation, and management for contextloop.
//!
//! Loads configuration from `~/.contextloop/config.toml` with environment
//! variable overrides. Validates all settings at startup.
//!
//! [`MemoryConfig`], [`RagConfig`] and [`ToolConfig`] double as per-request
//! settings: the turn orchestrator takes them as arguments to `run`, so a
//! caller can override the file defaults for a single turn.

use contextloop_core::memory::{MemoryKind, parse_kinds};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
///
/// Maps directly to `~/.contextloop/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key for the LLM provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// LLM endpoint and sampling defaults
    #[serde(default)]
    pub provider: ProviderSettings,

    /// Short-term retention and long-term extraction
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Retrieval settings
    #[serde(default)]
    pub rag: RagConfig,

    /// Tool-calling loop settings
    #[serde(default)]
    pub tools: ToolConfig,

    /// Context assembly settings
    #[serde(default)]
    pub context: ContextConfig,
}

fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("provider", &self.provider)
            .field("memory", &self.memory)
            .field("rag", &self.rag)
            .field("tools", &self.tools)
            .field("context", &self.context)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// OpenAI-compatible base URL
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Max tokens per LLM response
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    500
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

/// How the short-term store shapes what a read returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShortTermStrategy {
    /// The full log
    #[default]
    Buffer,
    /// Only the last `window_size` turns
    Window,
    /// Old turns folded into a running LLM digest
    Summary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Master switch for reading and writing short-term memory
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub strategy: ShortTermStrategy,

    /// Turns kept by the window strategy
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Summary strategy: this many most recent turns always stay verbatim
    #[serde(default = "default_summary_keep_recent")]
    pub summary_keep_recent: usize,

    /// Summary strategy: stale turns needed before the digest is refreshed
    #[serde(default = "default_summary_batch")]
    pub summary_batch: usize,

    /// Model for the summarizer; falls back to the provider model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_model: Option<String>,

    /// Long-term memory kinds injected into the context.
    /// Unknown names are ignored.
    #[serde(default = "default_include")]
    pub include: Vec<String>,

    #[serde(default)]
    pub long_term: LongTermConfig,
}

fn default_true() -> bool {
    true
}
fn default_window_size() -> usize {
    10
}
fn default_summary_keep_recent() -> usize {
    10
}
fn default_summary_batch() -> usize {
    10
}
fn default_include() -> Vec<String> {
    MemoryKind::ALL.iter().map(|k| k.as_str().to_string()).collect()
}

impl MemoryConfig {
    /// The configured long-term kinds, parsed.
    pub fn included_kinds(&self) -> Vec<MemoryKind> {
        parse_kinds(&self.include)
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: ShortTermStrategy::default(),
            window_size: default_window_size(),
            summary_keep_recent: default_summary_keep_recent(),
            summary_batch: default_summary_batch(),
            summary_model: None,
            include: default_include(),
            long_term: LongTermConfig::default(),
        }
    }
}

/// Which long-term extraction sub-tasks run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LongTermConfig {
    #[serde(default = "default_true")]
    pub semantic: bool,

    #[serde(default = "default_true")]
    pub episodic: bool,

    #[serde(default = "default_true")]
    pub profile: bool,

    #[serde(default = "default_true")]
    pub procedural: bool,

    /// Model for extraction calls; falls back to the provider model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl LongTermConfig {
    pub fn is_enabled(&self, kind: MemoryKind) -> bool {
        match kind {
            MemoryKind::Semantic => self.semantic,
            MemoryKind::Episodic => self.episodic,
            MemoryKind::Profile => self.profile,
            MemoryKind::Procedural => self.procedural,
        }
    }
}

impl Default for LongTermConfig {
    fn default() -> Self {
        Self {
            semantic: true,
            episodic: true,
            profile: true,
            procedural: true,
            model: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Namespaces to search; empty means the retriever's default
    #[serde(default)]
    pub namespaces: Vec<String>,

    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

fn default_top_k() -> usize {
    5
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            namespaces: Vec::new(),
            top_k: default_top_k(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Tools the model may use; empty means every registered tool
    #[serde(default)]
    pub allowed: Vec<String>,

    /// Upper bound on agent steps per turn
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Per-tool execution timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Tool output longer than this is cut before it reaches the model
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,

    /// Append tool activity to the short-term log
    #[serde(default = "default_true")]
    pub persist_activity: bool,
}

fn default_max_iterations() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_output_chars() -> usize {
    4000
}

impl ToolConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed: Vec::new(),
            max_iterations: default_max_iterations(),
            timeout_secs: default_timeout_secs(),
            max_output_chars: default_max_output_chars(),
            persist_activity: true,
        }
    }
}

/// Which source wins when the budget cannot hold everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityMode {
    Memory,
    Rag,
    #[default]
    Balanced,
}

impl std::str::FromStr for PriorityMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(PriorityMode::Memory),
            "rag" => Ok(PriorityMode::Rag),
            "balanced" => Ok(PriorityMode::Balanced),
            other => Err(format!("unknown priority mode '{other}' (expected memory, rag or balanced)")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Hard budget for the assembled context, in model tokens
    #[serde(default = "default_context_tokens")]
    pub max_tokens: usize,

    #[serde(default)]
    pub priority: PriorityMode,

    /// HuggingFace `tokenizer.json` matching the downstream model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokenizer_path: Option<PathBuf>,

    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

fn default_context_tokens() -> usize {
    4000
}
fn default_system_prompt() -> String {
    "You are a helpful assistant. Use the context below when it is relevant, and call tools when you need fresh information or computation.".into()
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_context_tokens(),
            priority: PriorityMode::default(),
            tokenizer_path: None,
            system_prompt: default_system_prompt(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.contextloop/config.toml).
    ///
    /// Also checks environment variables:
    /// - `CONTEXTLOOP_API_KEY` (highest priority), then `OPENAI_API_KEY`
    /// - `CONTEXTLOOP_MODEL`
    /// - `CONTEXTLOOP_BASE_URL`
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_env(&Self::config_dir().join("config.toml"))
    }

    /// [`load_from`](Self::load_from) plus the environment overrides of [`load`](Self::load).
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_from(path)?;

        if config.api_key.is_none() {
            config.api_key = std::env::var("CONTEXTLOOP_API_KEY")
                .ok()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok());
        }

        if let Ok(model) = std::env::var("CONTEXTLOOP_MODEL") {
            config.provider.model = model;
        }

        if let Ok(base_url) = std::env::var("CONTEXTLOOP_BASE_URL") {
            config.provider.base_url = base_url;
        }

        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".contextloop")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.provider.temperature) {
            return Err(ConfigError::ValidationError(
                "provider.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if !(100..=8000).contains(&self.context.max_tokens) {
            return Err(ConfigError::ValidationError(
                "context.max_tokens must be between 100 and 8000".into(),
            ));
        }

        if !(1..=20).contains(&self.rag.top_k) {
            return Err(ConfigError::ValidationError(
                "rag.top_k must be between 1 and 20".into(),
            ));
        }

        if !(1..=50).contains(&self.tools.max_iterations) {
            return Err(ConfigError::ValidationError(
                "tools.max_iterations must be between 1 and 50".into(),
            ));
        }

        if self.tools.timeout_secs == 0 {
            return Err(ConfigError::ValidationError("tools.timeout_secs must be > 0".into()));
        }

        if self.memory.window_size == 0 || self.memory.summary_keep_recent == 0 || self.memory.summary_batch == 0 {
            return Err(ConfigError::ValidationError(
                "memory.window_size, summary_keep_recent and summary_batch must be > 0".into(),
            ));
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            provider: ProviderSettings::default(),
            memory: MemoryConfig::default(),
            rag: RagConfig::default(),
            tools: ToolConfig::default(),
            context: ContextConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
