//! Retrieval collaborator: namespaced passage search.
//!
//! Index management and embeddings live outside this workspace; the turn
//! orchestrator only consumes [`Retriever`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RetrievalError;

/// One passage returned by the retriever.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedPassage {
    pub content: String,
    /// Relevance in [0, 1]
    pub score: f32,
    pub namespace: String,
    pub source_id: String,
    pub chunk_index: u32,
}

impl RetrievedPassage {
    /// Clamp the score into [0, 1]; NaN becomes 0.
    pub fn normalized(mut self) -> Self {
        self.score = if self.score.is_nan() {
            0.0
        } else {
            self.score.clamp(0.0, 1.0)
        };
        self
    }
}

#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(
        &self,
        query: &str,
        namespaces: &[String],
        top_k: usize,
    ) -> Result<Vec<RetrievedPassage>, RetrievalError>;
}
