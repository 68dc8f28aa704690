//! Query side of a ready index: embed the question, return the nearest chunks.

use std::sync::Arc;

use tracing::debug;

use crate::embedding::{EmbedError, EmbeddingGateway};
use crate::store::{RetrievalResult, VectorIndex};

/// Shares one immutable index between any number of concurrent queries.
#[derive(Clone)]
pub struct Retriever {
    index: Arc<VectorIndex>,
    gateway: EmbeddingGateway,
    top_k: usize,
}

impl Retriever {
    pub fn new(index: Arc<VectorIndex>, gateway: EmbeddingGateway, top_k: usize) -> Self {
        Self {
            index,
            gateway,
            top_k,
        }
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    /// The configured number of nearest chunks for `query`, best first.
    pub async fn retrieve(&self, query: &str) -> Result<Vec<RetrievalResult>, EmbedError> {
        self.retrieve_k(query, self.top_k).await
    }

    pub async fn retrieve_k(&self, query: &str, k: usize) -> Result<Vec<RetrievalResult>, EmbedError> {
        if self.index.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let vector = self.gateway.embed_query(query).await?;
        let hits = self.index.top_k(&vector, k);
        debug!(k, hits = hits.len(), best = hits.first().map(|h| h.score), "retrieved");
        Ok(hits)
    }
}
