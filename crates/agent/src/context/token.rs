//! Token counting.
//!
//! The budget invariant of the context builder is stated in units of
//! whatever [`TokenCounter`] it is given, so the counter must match the
//! tokenizer of the downstream model. [`HfTokenCounter`] loads that model's
//! `tokenizer.json`; [`ApproxTokenCounter`] is a last resort.

use std::sync::Arc;

use contextloop_config::ContextConfig;
use contextloop_core::Error;
use tracing::warn;

/// Counts tokens for a piece of text.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// Character heuristic: 1 token ≈ 4 bytes, rounded up.
#[derive(Debug)]
pub struct ApproxTokenCounter;

impl ApproxTokenCounter {
    pub fn new() -> Self {
        warn!("No tokenizer configured; token counts are approximate (4 bytes per token)");
        Self
    }
}

impl TokenCounter for ApproxTokenCounter {
    fn count(&self, text: &str) -> usize {
        text.len().div_ceil(4)
    }
}

/// Exact counts from a HuggingFace `tokenizer.json`.
#[cfg(feature = "hf-tokenizer")]
pub struct HfTokenCounter {
    tokenizer: tokenizers::Tokenizer,
}

#[cfg(feature = "hf-tokenizer")]
impl HfTokenCounter {
    pub fn from_file(path: &std::path::Path) -> Result<Self, Error> {
        let tokenizer = tokenizers::Tokenizer::from_file(path).map_err(|e| {
            Error::configuration(format!("failed to load tokenizer {}: {e}", path.display()))
        })?;
        Ok(Self { tokenizer })
    }
}

#[cfg(feature = "hf-tokenizer")]
impl TokenCounter for HfTokenCounter {
    fn count(&self, text: &str) -> usize {
        match self.tokenizer.encode(text, false) {
            Ok(encoding) => encoding.len(),
            Err(e) => {
                // Byte length bounds any byte-level BPE count from above.
                warn!(error = %e, "Tokenizer failed to encode text; using byte length");
                text.len()
            }
        }
    }
}

/// Pick the counter for a context configuration.
pub fn counter_for(config: &ContextConfig) -> Result<Arc<dyn TokenCounter>, Error> {
    match &config.tokenizer_path {
        #[cfg(feature = "hf-tokenizer")]
        Some(path) => Ok(Arc::new(HfTokenCounter::from_file(path)?)),
        #[cfg(not(feature = "hf-tokenizer"))]
        Some(path) => Err(Error::configuration(format!(
            "tokenizer_path {} is set but this build lacks the hf-tokenizer feature",
            path.display()
        ))),
        None => Ok(Arc::new(ApproxTokenCounter::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_is_zero() {
        assert_eq!(ApproxTokenCounter::new().count(""), 0);
    }

    #[test]
    fn four_chars_is_one_token() {
        assert_eq!(ApproxTokenCounter::new().count("test"), 1);
    }

    #[test]
    fn five_chars_rounds_up() {
        assert_eq!(ApproxTokenCounter::new().count("hello"), 2);
    }

    #[test]
    fn hundred_chars() {
        assert_eq!(ApproxTokenCounter::new().count(&"a".repeat(100)), 25);
    }

    #[test]
    fn default_config_uses_heuristic() {
        let counter = counter_for(&ContextConfig::default()).unwrap();
        assert_eq!(counter.count("abcdefgh"), 2);
    }

    #[test]
    fn missing_tokenizer_file_is_configuration_error() {
        let config = ContextConfig {
            tokenizer_path: Some("/nonexistent/tokenizer.json".into()),
            ..ContextConfig::default()
        };
        assert!(matches!(counter_for(&config), Err(Error::Configuration { .. })));
    }
}
