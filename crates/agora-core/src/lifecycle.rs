//! Startup sequence that produces the index queries are served from.
//!
//! ```text
//! CheckLocal --(load ok)--> Ready
//!     | missing or unusable
//! CheckRemote --(fetch + load ok)--> Ready
//!     | absent, unusable or store error
//! Rebuild --(sync, chunk, embed, build, save)--> Ready
//!     | any error
//! Failed
//! ```

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::chunks::ChunkParams;
use crate::config::Config;
use crate::documents::{read_corpus, ScanError};
use crate::embedding::EmbeddingGateway;
use crate::index::{build_index, BuildError};
use crate::persist;
use crate::remote::RemoteError;
use crate::source::DocumentSource;
use crate::store::{IndexError, IndexSpec, VectorIndex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    CheckLocal,
    CheckRemote,
    Rebuild,
    Ready,
    Failed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifecycleState::CheckLocal => "check-local",
            LifecycleState::CheckRemote => "check-remote",
            LifecycleState::Rebuild => "rebuild",
            LifecycleState::Ready => "ready",
            LifecycleState::Failed => "failed",
        })
    }
}

/// Where the served index came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOrigin {
    Local,
    Remote,
    Rebuilt,
}

impl fmt::Display for IndexOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IndexOrigin::Local => "local",
            IndexOrigin::Remote => "remote",
            IndexOrigin::Rebuilt => "rebuilt",
        })
    }
}

/// The index in its final, read-only form.
#[derive(Debug, Clone)]
pub struct ReadyIndex {
    pub index: Arc<VectorIndex>,
    pub origin: IndexOrigin,
}

pub struct IndexLifecycle {
    source: DocumentSource,
    gateway: EmbeddingGateway,
    index_dir: PathBuf,
    spec: IndexSpec,
    chunk_params: ChunkParams,
    index_batch_size: usize,
    push_after_rebuild: bool,
    visited: Vec<LifecycleState>,
}

impl IndexLifecycle {
    pub fn new(config: &Config, source: DocumentSource, gateway: EmbeddingGateway) -> Self {
        Self {
            source,
            gateway,
            index_dir: config.local_index_dir.clone(),
            spec: config.index_spec(),
            chunk_params: config.chunk_params(),
            index_batch_size: config.index_batch_size,
            push_after_rebuild: config.push_index_after_rebuild,
            visited: Vec::new(),
        }
    }

    /// States entered by the last [`run`](Self::run), in order.
    pub fn visited(&self) -> &[LifecycleState] {
        &self.visited
    }

    pub async fn run(&mut self) -> Result<ReadyIndex, LifecycleError> {
        self.visited.clear();

        self.enter(LifecycleState::CheckLocal);
        if let Some(index) = self.check_local() {
            return Ok(self.ready(index, IndexOrigin::Local));
        }

        self.enter(LifecycleState::CheckRemote);
        if let Some(index) = self.check_remote().await {
            return Ok(self.ready(index, IndexOrigin::Remote));
        }

        self.enter(LifecycleState::Rebuild);
        match self.rebuild().await {
            Ok(index) => Ok(self.ready(index, IndexOrigin::Rebuilt)),
            Err(e) => {
                self.enter(LifecycleState::Failed);
                error!(error = %e, "index lifecycle failed");
                Err(e)
            }
        }
    }

    /// Builds a fresh index from the remote corpus and saves it locally, pushing it to
    /// the remote store when configured.
    pub async fn rebuild(&self) -> Result<VectorIndex, LifecycleError> {
        let report = self.source.sync_documents().await?;
        let cache_dir = self.source.cache_dir();
        let documents = if cache_dir.is_dir() {
            read_corpus(cache_dir)?
        } else {
            Vec::new()
        };
        info!(
            documents = documents.len(),
            fetch_failures = report.failed.len(),
            "read document cache"
        );

        let index = build_index(
            &documents,
            &self.chunk_params,
            &self.gateway,
            self.spec,
            self.index_batch_size,
        )
        .await?;
        persist::save(&index, &self.index_dir).map_err(LifecycleError::Persist)?;

        if self.push_after_rebuild {
            match self.source.push_index_artifacts(&self.index_dir).await {
                Ok(()) => info!("pushed rebuilt index"),
                Err(e) => warn!(error = %e, "failed to push rebuilt index; continuing"),
            }
        }
        Ok(index)
    }

    fn check_local(&self) -> Option<VectorIndex> {
        if !persist::artifacts_present(&self.index_dir) {
            info!(dir = %self.index_dir.display(), "no local index");
            return None;
        }
        self.load("local")
    }

    async fn check_remote(&self) -> Option<VectorIndex> {
        match self.source.fetch_index_artifacts(&self.index_dir).await {
            Ok(true) => self.load("remote"),
            Ok(false) => None,
            Err(e) => {
                warn!(error = %e, "could not fetch remote index");
                None
            }
        }
    }

    fn load(&self, origin: &str) -> Option<VectorIndex> {
        match persist::load(&self.index_dir, self.spec) {
            Ok(index) => Some(index),
            Err(e) => {
                warn!(origin, error = %e, "index unusable");
                None
            }
        }
    }

    fn enter(&mut self, state: LifecycleState) {
        info!(%state, "index lifecycle");
        self.visited.push(state);
    }

    fn ready(&mut self, index: VectorIndex, origin: IndexOrigin) -> ReadyIndex {
        self.enter(LifecycleState::Ready);
        info!(%origin, entries = index.len(), "index ready");
        ReadyIndex {
            index: Arc::new(index),
            origin,
        }
    }
}

/// The `Failed` state, with its cause.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("remote store unavailable: {0}")]
    Remote(#[from] RemoteError),
    #[error("cannot read document cache: {0}")]
    Scan(#[from] ScanError),
    #[error("index build failed: {0}")]
    Build(#[from] BuildError),
    #[error("cannot save index: {0}")]
    Persist(IndexError),
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use async_trait::async_trait;

    use super::*;
    use crate::chunks::Chunk;
    use crate::embedding::{EmbedError, Embedder};
    use crate::remote::{MemoryStore, TEXT_MIME};
    use crate::store::Metric;

    struct ConstEmbedder;

    #[async_trait]
    impl Embedder for ConstEmbedder {
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
        fn dimensions(&self) -> usize {
            2
        }
        fn provider(&self) -> &str {
            "const"
        }
    }

    fn config(dir: &std::path::Path) -> Config {
        Config {
            remote_root_folder_id: "root".to_string(),
            local_cache_dir: dir.join("cache"),
            local_index_dir: dir.join("index"),
            embedding_dimensions: 2,
            metric: Metric::Cosine,
            ..Config::default()
        }
    }

    fn lifecycle(config: &Config, store: Arc<MemoryStore>) -> IndexLifecycle {
        let source = DocumentSource::new(store, config);
        let gateway = EmbeddingGateway::new(Arc::new(ConstEmbedder), 10);
        IndexLifecycle::new(config, source, gateway)
    }

    #[tokio::test]
    async fn valid_local_index_skips_the_remote_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let mut index = VectorIndex::new(config.index_spec());
        index
            .add(
                Chunk {
                    text: "saved".to_string(),
                    metadata: BTreeMap::new(),
                },
                vec![0.0, 1.0],
            )
            .unwrap();
        persist::save(&index, &config.local_index_dir).unwrap();

        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        let mut lifecycle = lifecycle(&config, store);
        let ready = lifecycle.run().await.unwrap();
        assert_eq!(ready.origin, IndexOrigin::Local);
        assert_eq!(ready.index.len(), 1);
        assert_eq!(
            lifecycle.visited(),
            [LifecycleState::CheckLocal, LifecycleState::Ready]
        );
    }

    #[tokio::test]
    async fn rebuild_pushes_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            push_index_after_rebuild: true,
            ..config(dir.path())
        };
        let store = Arc::new(MemoryStore::new());
        store.insert("root", "notes.txt", TEXT_MIME, "Some text worth indexing.");
        let mut lifecycle = lifecycle(&config, store.clone());
        let ready = lifecycle.run().await.unwrap();
        assert_eq!(ready.origin, IndexOrigin::Rebuilt);

        let folder = lifecycle
            .source
            .locate_folder(&config.index_folder_name)
            .await
            .unwrap()
            .unwrap();
        assert!(store.content_of(&folder.id, persist::STORE_FILE).is_some());
        assert!(store.content_of(&folder.id, persist::VECTORS_FILE).is_some());
    }

    #[tokio::test]
    async fn unreachable_store_without_local_index_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        let mut lifecycle = lifecycle(&config, store);
        assert!(matches!(
            lifecycle.run().await,
            Err(LifecycleError::Remote(_))
        ));
        assert_eq!(lifecycle.visited().last(), Some(&LifecycleState::Failed));
    }
}
