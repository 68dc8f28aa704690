//! Service configuration: one struct, read from `config.toml` (app data directory or an
//! explicit path), overridden by environment variables, validated once at startup.
//!
//! Credentials live in [`Secrets`], which is never serialized.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::app_data;
use crate::chunks::{ChunkParams, DEFAULT_AUTHOR, DEFAULT_MAX_CHARS, DEFAULT_OVERLAP};
use crate::embedding::DEFAULT_BATCH_SIZE;
use crate::openai;
use crate::store::{IndexSpec, Metric};

pub const CONFIG_FILENAME: &str = "config.toml";

pub const ENV_ROOT_FOLDER: &str = "AGORA_REMOTE_ROOT_FOLDER_ID";
/// Accepted as a fallback for [`ENV_ROOT_FOLDER`].
pub const ENV_DRIVE_FOLDER: &str = "GOOGLE_DRIVE_FOLDER_ID";
pub const ENV_CACHE_DIR: &str = "AGORA_CACHE_DIR";
pub const ENV_INDEX_DIR: &str = "AGORA_INDEX_DIR";
pub const ENV_OPENAI_KEY: &str = "OPENAI_API_KEY";
pub const ENV_GOOGLE_CREDENTIALS: &str = "GOOGLE_CREDENTIALS_JSON";

/// Largest batch the embeddings API accepts.
const MAX_EMBEDDING_BATCH: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    #[default]
    OpenAi,
    Ollama,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Remote folder holding the corpus and the index subfolder.
    pub remote_root_folder_id: String,
    /// Name of the remote subfolder holding the persisted index.
    pub index_folder_name: String,
    pub local_cache_dir: PathBuf,
    pub local_index_dir: PathBuf,
    pub history_dir: PathBuf,
    pub embedding_provider: EmbeddingProvider,
    pub embedding_model: String,
    pub embedding_dimensions: usize,
    /// Texts per embedding request.
    pub embedding_batch_size: usize,
    pub ollama_url: String,
    pub metric: Metric,
    pub chunk_max_len: usize,
    pub chunk_overlap: usize,
    /// Tag added to every chunk's metadata.
    pub corpus_author: String,
    /// Chunks per sub-index while building.
    pub index_batch_size: usize,
    pub top_k: usize,
    pub push_index_after_rebuild: bool,
    pub chat_model: String,
    pub chat_temperature: f32,
    pub chat_max_tokens: u32,
    pub request_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            remote_root_folder_id: String::new(),
            index_folder_name: "vector_index".to_string(),
            local_cache_dir: app_data::default_cache_dir(),
            local_index_dir: app_data::default_index_dir(),
            history_dir: app_data::default_history_dir(),
            embedding_provider: EmbeddingProvider::OpenAi,
            embedding_model: openai::DEFAULT_EMBED_MODEL.to_string(),
            embedding_dimensions: openai::DEFAULT_DIMENSIONS,
            embedding_batch_size: DEFAULT_BATCH_SIZE,
            ollama_url: crate::ollama::DEFAULT_BASE_URL.to_string(),
            metric: Metric::Cosine,
            chunk_max_len: DEFAULT_MAX_CHARS,
            chunk_overlap: DEFAULT_OVERLAP,
            corpus_author: DEFAULT_AUTHOR.to_string(),
            index_batch_size: 1000,
            top_k: 4,
            push_index_after_rebuild: false,
            chat_model: openai::DEFAULT_CHAT_MODEL.to_string(),
            chat_temperature: 0.3,
            chat_max_tokens: 250,
            request_timeout_secs: 60,
        }
    }
}

impl Config {
    /// Overrides fields from environment-style variables supplied by `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(id) = non_empty(ENV_ROOT_FOLDER).or_else(|| non_empty(ENV_DRIVE_FOLDER)) {
            self.remote_root_folder_id = id;
        }
        if let Some(dir) = non_empty(ENV_CACHE_DIR) {
            self.local_cache_dir = PathBuf::from(dir);
        }
        if let Some(dir) = non_empty(ENV_INDEX_DIR) {
            self.local_index_dir = PathBuf::from(dir);
        }
    }

    /// Checks every field; the first violation is returned.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.remote_root_folder_id.trim().is_empty() {
            return Err(ConfigError::Missing("remote_root_folder_id"));
        }
        if self.index_folder_name.trim().is_empty() {
            return Err(ConfigError::Missing("index_folder_name"));
        }
        if self.embedding_model.trim().is_empty() {
            return Err(ConfigError::Missing("embedding_model"));
        }
        if self.embedding_dimensions == 0 {
            return Err(invalid("embedding_dimensions", "must be greater than zero"));
        }
        if !(1..=MAX_EMBEDDING_BATCH).contains(&self.embedding_batch_size) {
            return Err(invalid(
                "embedding_batch_size",
                format!("must be between 1 and {MAX_EMBEDDING_BATCH}"),
            ));
        }
        if self.embedding_provider == EmbeddingProvider::Ollama {
            url::Url::parse(&self.ollama_url).map_err(|e| invalid("ollama_url", e.to_string()))?;
        }
        if self.chunk_max_len == 0 {
            return Err(invalid("chunk_max_len", "must be greater than zero"));
        }
        if self.chunk_overlap >= self.chunk_max_len {
            return Err(invalid(
                "chunk_overlap",
                format!("must be less than chunk_max_len ({})", self.chunk_max_len),
            ));
        }
        if self.index_batch_size == 0 {
            return Err(invalid("index_batch_size", "must be greater than zero"));
        }
        if self.top_k == 0 {
            return Err(invalid("top_k", "must be greater than zero"));
        }
        if !(0.0..=2.0).contains(&self.chat_temperature) {
            return Err(invalid("chat_temperature", "must be between 0 and 2"));
        }
        if self.request_timeout_secs == 0 {
            return Err(invalid("request_timeout_secs", "must be greater than zero"));
        }
        Ok(())
    }

    pub fn chunk_params(&self) -> ChunkParams {
        ChunkParams::new(self.chunk_max_len, self.chunk_overlap).with_author(&self.corpus_author)
    }

    /// Metric and dimension every index of this configuration must have.
    pub fn index_spec(&self) -> IndexSpec {
        IndexSpec {
            metric: self.metric,
            dimensions: self.embedding_dimensions,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Path of the config file in the app data directory.
pub fn default_config_path() -> Option<PathBuf> {
    app_data::app_data_dir().map(|dir| dir.join(CONFIG_FILENAME))
}

/// Reads the config file at `path` (or the default location), applies the process
/// environment, and validates. A missing file means defaults.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.map(Path::to_path_buf).or_else(default_config_path);
    let mut config = match path {
        Some(path) if path.exists() => {
            let s = std::fs::read_to_string(&path).map_err(ConfigError::Read)?;
            toml::from_str(&s).map_err(ConfigError::Parse)?
        }
        _ => Config::default(),
    };
    config.apply_env(|key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// Write `config` to `path` (or the default location).
pub fn save_config(config: &Config, path: Option<&Path>) -> Result<PathBuf, ConfigError> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => default_config_path().ok_or(ConfigError::NoDataDir)?,
    };
    let s = toml::to_string_pretty(config).map_err(ConfigError::Serialize)?;
    std::fs::write(&path, s).map_err(ConfigError::Write)?;
    Ok(path)
}

/// Credentials read from the environment only.
#[derive(Clone, Default)]
pub struct Secrets {
    pub openai_api_key: Option<String>,
    /// Service-account key JSON for the remote file store.
    pub google_credentials_json: Option<String>,
}

impl Secrets {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            openai_api_key: non_empty(ENV_OPENAI_KEY),
            google_credentials_json: non_empty(ENV_GOOGLE_CREDENTIALS),
        }
    }

    pub fn google_credentials(&self) -> Result<&str, ConfigError> {
        self.google_credentials_json
            .as_deref()
            .ok_or(ConfigError::MissingSecret(ENV_GOOGLE_CREDENTIALS))
    }

    pub fn openai_key(&self) -> Result<&str, ConfigError> {
        self.openai_api_key
            .as_deref()
            .ok_or(ConfigError::MissingSecret(ENV_OPENAI_KEY))
    }
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = |s: &Option<String>| if s.is_some() { "<set>" } else { "<unset>" };
        f.debug_struct("Secrets")
            .field("openai_api_key", &shown(&self.openai_api_key))
            .field("google_credentials_json", &shown(&self.google_credentials_json))
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not determine app data directory")]
    NoDataDir,
    #[error("failed to read config: {0}")]
    Read(std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("failed to write config: {0}")]
    Write(std::io::Error),
    #[error("missing required setting: {0}")]
    Missing(&'static str),
    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("environment variable {0} is not set")]
    MissingSecret(&'static str),
}
