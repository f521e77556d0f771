pub mod chat;
pub mod config_cmd;
pub mod extract;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use contextloop_agent::{TurnOrchestrator, TurnOrchestratorBuilder};
use contextloop_config::AppConfig;
use contextloop_providers::OpenAiCompatProvider;
use tracing::debug;

/// Load `path`, or the default config file, with environment overrides.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    let config = match path {
        Some(path) => AppConfig::load_with_env(path),
        None => AppConfig::load(),
    };
    let config = config.context("Failed to load config")?;
    debug!(
        model = %config.provider.model,
        base_url = %config.provider.base_url,
        budget = config.context.max_tokens,
        "Config loaded"
    );
    Ok(config)
}

/// An orchestrator builder wired to the configured provider and built-in tools.
pub fn orchestrator(config: &AppConfig) -> anyhow::Result<TurnOrchestratorBuilder> {
    if !config.has_api_key() {
        eprintln!();
        eprintln!("  ERROR: No API key configured!");
        eprintln!();
        eprintln!("  Set one of these environment variables:");
        eprintln!("    CONTEXTLOOP_API_KEY=sk-...   (generic)");
        eprintln!("    OPENAI_API_KEY=sk-...        (for OpenAI direct)");
        eprintln!();
        eprintln!("  Or add `api_key` to your config file:");
        eprintln!("    {}", AppConfig::config_dir().join("config.toml").display());
        eprintln!();
    }
    let provider = OpenAiCompatProvider::from_settings(&config.provider, config.api_key.as_deref())?;
    Ok(TurnOrchestrator::from_config(config)
        .with_provider(Arc::new(provider))
        .with_tools(Arc::new(contextloop_tools::default_registry())))
}
