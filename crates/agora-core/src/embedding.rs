//! Embedding gateway: turns chunk texts into vectors through a remote [`Embedder`],
//! batch by batch.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{Config, EmbeddingProvider, Secrets};
use crate::ollama::OllamaEmbedder;
use crate::openai::OpenAiEmbedder;

/// Default cap on texts per embedding request.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// A backend that maps texts to fixed-dimension vectors, one per input, in order.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;

    /// Length of every vector this backend returns.
    fn dimensions(&self) -> usize;

    /// Short provider label for logs and errors.
    fn provider(&self) -> &str;
}

/// Builds the embedder selected in `config`.
pub fn embedder_from_config(
    config: &Config,
    secrets: &Secrets,
) -> Result<Arc<dyn Embedder>, EmbedError> {
    let timeout = config.request_timeout();
    Ok(match config.embedding_provider {
        EmbeddingProvider::OpenAi => {
            let key = secrets
                .openai_api_key
                .as_deref()
                .ok_or_else(|| EmbedError::request("OpenAI", "OPENAI_API_KEY is not set"))?;
            Arc::new(
                OpenAiEmbedder::new(key, timeout)?
                    .with_model(&config.embedding_model)
                    .with_dimensions(config.embedding_dimensions),
            )
        }
        EmbeddingProvider::Ollama => Arc::new(
            OllamaEmbedder::from_url(&config.ollama_url)?
                .with_embed_model(&config.embedding_model)
                .with_dimensions(config.embedding_dimensions),
        ),
    })
}

/// Sends texts to an [`Embedder`] in batches of at most `batch_size` and checks that
/// every response has one vector of the right dimension per input.
#[derive(Clone)]
pub struct EmbeddingGateway {
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
}

impl EmbeddingGateway {
    pub fn new(embedder: Arc<dyn Embedder>, batch_size: usize) -> Self {
        Self {
            embedder,
            batch_size: batch_size.max(1),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.embedder.dimensions()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Embeds one batch of at most `batch_size` texts.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if texts.len() > self.batch_size {
            return Err(EmbedError::BatchTooLarge {
                size: texts.len(),
                limit: self.batch_size,
            });
        }
        let vectors = self.embedder.embed_batch(texts).await?;
        if vectors.len() != texts.len() {
            return Err(EmbedError::CountMismatch {
                expected: texts.len(),
                actual: vectors.len(),
            });
        }
        let dimensions = self.dimensions();
        if let Some(bad) = vectors.iter().find(|v| v.len() != dimensions) {
            return Err(EmbedError::DimensionMismatch {
                expected: dimensions,
                actual: bad.len(),
            });
        }
        Ok(vectors)
    }

    /// Embeds any number of texts, one capped batch after another. The first failing
    /// batch aborts the whole call; no partial result is returned.
    pub async fn embed_all(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let batches = texts.len().div_ceil(self.batch_size);
        let mut vectors = Vec::with_capacity(texts.len());
        for (batch, slice) in texts.chunks(self.batch_size).enumerate() {
            let embedded = self.embed(slice).await.map_err(|e| EmbedError::Batch {
                batch,
                source: Box::new(e),
            })?;
            debug!(batch = batch + 1, batches, size = slice.len(), "embedded batch");
            vectors.extend(embedded);
        }
        info!(
            provider = self.embedder.provider(),
            texts = texts.len(),
            batches,
            "embedded texts"
        );
        Ok(vectors)
    }

    /// Embeds a single query string.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let mut vectors = self.embed(&[text.to_string()]).await?;
        vectors.pop().ok_or(EmbedError::CountMismatch {
            expected: 1,
            actual: 0,
        })
    }
}

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("embedding request failed ({provider}): {message}")]
    Request { provider: String, message: String },
    #[error("batch of {size} texts exceeds the limit of {limit}")]
    BatchTooLarge { size: usize, limit: usize },
    #[error("expected {expected} embeddings, got {actual}")]
    CountMismatch { expected: usize, actual: usize },
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding batch {batch} failed: {source}")]
    Batch {
        batch: usize,
        #[source]
        source: Box<EmbedError>,
    },
}

impl EmbedError {
    pub(crate) fn request(provider: &str, message: impl Into<String>) -> Self {
        EmbedError::Request {
            provider: provider.to_string(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Returns `[len, batch call number]` per text; fails on the call numbered `fail_on`.
    struct CountingEmbedder {
        calls: AtomicUsize,
        fail_on: Option<usize>,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_on == Some(call) {
                return Err(EmbedError::request("test", "rate limited"));
            }
            Ok(texts.iter().map(|t| vec![t.len() as f32, call as f32]).collect())
        }

        fn dimensions(&self) -> usize {
            2
        }

        fn provider(&self) -> &str {
            "test"
        }
    }

    fn gateway(fail_on: Option<usize>, batch_size: usize) -> (EmbeddingGateway, Arc<CountingEmbedder>) {
        let embedder = Arc::new(CountingEmbedder {
            calls: AtomicUsize::new(0),
            fail_on,
        });
        (EmbeddingGateway::new(embedder.clone(), batch_size), embedder)
    }

    fn texts(n: usize) -> Vec<String> {
        (0..n).map(|i| "x".repeat(i + 1)).collect()
    }

    #[tokio::test]
    async fn embed_all_batches_in_order() {
        let (gateway, embedder) = gateway(None, 2);
        let vectors = gateway.embed_all(&texts(5)).await.unwrap();
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);
        let lens: Vec<f32> = vectors.iter().map(|v| v[0]).collect();
        assert_eq!(lens, [1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(vectors[4][1], 2.0);
    }

    #[tokio::test]
    async fn failing_batch_aborts_everything() {
        let (gateway, _) = gateway(Some(1), 2);
        let err = gateway.embed_all(&texts(5)).await.unwrap_err();
        assert!(matches!(err, EmbedError::Batch { batch: 1, .. }));
    }

    #[tokio::test]
    async fn single_call_is_capped() {
        let (gateway, _) = gateway(None, 2);
        let err = gateway.embed(&texts(3)).await.unwrap_err();
        assert!(matches!(err, EmbedError::BatchTooLarge { size: 3, limit: 2 }));
    }

    #[tokio::test]
    async fn empty_input_makes_no_call() {
        let (gateway, embedder) = gateway(None, 2);
        assert!(gateway.embed_all(&[]).await.unwrap().is_empty());
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }
}
