//! All backend logic independent of how the service is run.
//!
//! The corpus lives in a remote folder and is mirrored into a local cache; the vector
//! index is loaded locally, fetched from the remote folder, or rebuilt (see
//! [lifecycle]). Agora keeps config, cache, index and chat history in its own app data
//! directory by default (see [app_data]).

pub mod app_data;
pub mod assistant;
pub mod chat;
pub mod chunks;
pub mod config;
pub mod documents;
pub mod drive;
pub mod embedding;
pub mod history;
pub mod index;
pub mod lifecycle;
pub mod ollama;
pub mod openai;
pub mod persist;
pub mod remote;
pub mod retriever;
pub mod source;
pub mod store;

pub use app_data::app_data_dir;
pub use assistant::{Answer, Assistant, AssistantError};
pub use chat::{build_prompt, condense_prompt, ChatError, ChatMessage, ChatModel, Role};
pub use chunks::{chunk_document, chunk_documents, split_text, Chunk, ChunkParams};
pub use config::{load_config, save_config, Config, ConfigError, EmbeddingProvider, Secrets};
pub use documents::{read_corpus, Document, ScanError};
pub use drive::{DriveStore, ServiceAccountKey};
pub use embedding::{embedder_from_config, EmbedError, Embedder, EmbeddingGateway};
pub use history::{HistoryError, HistoryStore, Turn};
pub use index::{build_index, BuildError};
pub use lifecycle::{IndexLifecycle, IndexOrigin, LifecycleError, LifecycleState, ReadyIndex};
pub use remote::{FileQuery, MemoryStore, RemoteError, RemoteFile, RemoteStore};
pub use retriever::Retriever;
pub use source::{DocumentSource, SyncReport};
pub use store::{IndexError, IndexSpec, Metric, RetrievalResult, VectorIndex};

/// Returns a short status string. Used to verify the backend is wired up.
pub fn status() -> &'static str {
    "agora-core ready"
}
