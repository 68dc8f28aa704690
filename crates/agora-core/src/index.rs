//! Build pipeline: documents → chunks → embeddings → vector index.

use tracing::info;

use crate::chunks::{chunk_documents, ChunkParams};
use crate::documents::Document;
use crate::embedding::{EmbedError, EmbeddingGateway};
use crate::store::{IndexError, IndexSpec, VectorIndex};

/// Chunks `documents`, embeds every chunk through `gateway`, and builds an index from
/// sub-indexes of `batch_size` entries. Fails rather than returning an empty index.
pub async fn build_index(
    documents: &[Document],
    params: &ChunkParams,
    gateway: &EmbeddingGateway,
    spec: IndexSpec,
    batch_size: usize,
) -> Result<VectorIndex, BuildError> {
    if documents.is_empty() {
        return Err(BuildError::NoDocuments);
    }
    let chunks = chunk_documents(documents, params);
    if chunks.is_empty() {
        return Err(BuildError::NoChunks);
    }
    if gateway.dimensions() != spec.dimensions {
        return Err(BuildError::Index(IndexError::DimensionMismatch {
            expected: spec.dimensions,
            actual: gateway.dimensions(),
        }));
    }
    info!(documents = documents.len(), chunks = chunks.len(), "chunked corpus");

    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let embeddings = gateway.embed_all(&texts).await?;
    let index = VectorIndex::build(spec, chunks, embeddings, batch_size)?;
    info!(entries = index.len(), spec = %spec, "built vector index");
    Ok(index)
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no documents to index")]
    NoDocuments,
    #[error("documents produced no chunks")]
    NoChunks,
    #[error("embedding failed: {0}")]
    Embed(#[from] EmbedError),
    #[error("index error: {0}")]
    Index(#[from] IndexError),
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::embedding::Embedder;
    use crate::store::Metric;

    /// Embeds text as (length, vowel count).
    struct ShapeEmbedder;

    #[async_trait]
    impl Embedder for ShapeEmbedder {
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
            Ok(texts
                .iter()
                .map(|t| {
                    let vowels = t.chars().filter(|c| "aeiou".contains(*c)).count();
                    vec![t.chars().count() as f32, vowels as f32]
                })
                .collect())
        }

        fn dimensions(&self) -> usize {
            2
        }

        fn provider(&self) -> &str {
            "shape"
        }
    }

    fn gateway() -> EmbeddingGateway {
        EmbeddingGateway::new(Arc::new(ShapeEmbedder), 3)
    }

    const SPEC: IndexSpec = IndexSpec {
        metric: Metric::L2,
        dimensions: 2,
    };

    #[tokio::test]
    async fn one_entry_per_chunk_across_batches() {
        let docs = vec![
            Document::new("a.txt", "one two three four five six seven eight nine ten"),
            Document::new("b.txt", "short"),
        ];
        let params = ChunkParams::new(12, 3);
        let expected = chunk_documents(&docs, &params).len();
        let index = build_index(&docs, &params, &gateway(), SPEC, 2).await.unwrap();
        assert_eq!(index.len(), expected);
        assert!(expected > 3);
    }

    #[tokio::test]
    async fn empty_inputs_fail() {
        let params = ChunkParams::default();
        assert!(matches!(
            build_index(&[], &params, &gateway(), SPEC, 10).await,
            Err(BuildError::NoDocuments)
        ));
        let blank = vec![Document::new("blank.txt", "")];
        assert!(matches!(
            build_index(&blank, &params, &gateway(), SPEC, 10).await,
            Err(BuildError::NoChunks)
        ));
    }

    #[tokio::test]
    async fn embedder_dimension_must_match_spec() {
        let docs = vec![Document::new("a.txt", "text")];
        let spec = IndexSpec {
            metric: Metric::Cosine,
            dimensions: 3,
        };
        assert!(matches!(
            build_index(&docs, &ChunkParams::default(), &gateway(), spec, 10).await,
            Err(BuildError::Index(IndexError::DimensionMismatch { .. }))
        ));
    }
}
