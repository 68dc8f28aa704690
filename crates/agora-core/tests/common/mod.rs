#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use agora_core::{
    Config, DocumentSource, EmbedError, Embedder, EmbeddingGateway, IndexLifecycle, MemoryStore,
    Metric,
};
use async_trait::async_trait;

pub const VOCABULARY: [&str; 5] = ["freedom", "miracle", "grand", "inquisitor", "speaks"];
pub const INQUISITOR: &str = "The grand inquisitor speaks of freedom and miracle.";

/// One dimension per vocabulary word, counting its occurrences in the text.
#[derive(Default)]
pub struct VocabularyEmbedder {
    pub calls: AtomicUsize,
}

impl VocabularyEmbedder {
    pub fn vector(text: &str) -> Vec<f32> {
        let text = text.to_lowercase();
        VOCABULARY
            .iter()
            .map(|word| text.matches(word).count() as f32)
            .collect()
    }
}

#[async_trait]
impl Embedder for VocabularyEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }

    fn dimensions(&self) -> usize {
        VOCABULARY.len()
    }

    fn provider(&self) -> &str {
        "vocabulary"
    }
}

/// Config rooted in `dir`, remote root folder `root`, sized for [`VocabularyEmbedder`].
pub fn test_config(dir: &Path) -> Config {
    Config {
        remote_root_folder_id: "root".to_string(),
        local_cache_dir: dir.join("cache"),
        local_index_dir: dir.join("index"),
        history_dir: dir.join("history"),
        embedding_dimensions: VOCABULARY.len(),
        embedding_batch_size: 2,
        metric: Metric::Cosine,
        chunk_max_len: 20,
        chunk_overlap: 5,
        index_batch_size: 3,
        ..Config::default()
    }
}

pub fn gateway(embedder: Arc<VocabularyEmbedder>, config: &Config) -> EmbeddingGateway {
    EmbeddingGateway::new(embedder, config.embedding_batch_size)
}

pub fn lifecycle(
    config: &Config,
    store: Arc<MemoryStore>,
    embedder: Arc<VocabularyEmbedder>,
) -> IndexLifecycle {
    let source = DocumentSource::new(store, config);
    IndexLifecycle::new(config, source, gateway(embedder, config))
}
