//! Conversation history: one pretty-printed JSON array of turns per session, stored as
//! `<session>.json` in the history directory.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::chat::{ChatMessage, Role};

const MAX_SESSION_ID_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    pub fn to_message(&self) -> ChatMessage {
        ChatMessage {
            role: self.role,
            content: self.content.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HistoryStore {
    dir: PathBuf,
}

impl HistoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// All turns of `session`, oldest first. An unknown session has no turns.
    pub fn load(&self, session: &str) -> Result<Vec<Turn>, HistoryError> {
        let path = self.path_for(session)?;
        if !path.exists() {
            return Ok(Vec::new());
        }
        let bytes = std::fs::read(&path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Appends `turns` to `session` and rewrites its file in one rename.
    pub fn append(&self, session: &str, turns: &[Turn]) -> Result<(), HistoryError> {
        let mut all = self.load(session)?;
        all.extend_from_slice(turns);
        let path = self.path_for(session)?;
        std::fs::create_dir_all(&self.dir)?;
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&serde_json::to_vec_pretty(&all)?)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| HistoryError::Io(e.error))?;
        debug!(session, turns = all.len(), "saved chat history");
        Ok(())
    }

    fn path_for(&self, session: &str) -> Result<PathBuf, HistoryError> {
        validate_session_id(session)?;
        Ok(self.dir.join(format!("{session}.json")))
    }
}

/// Session ids become file names: ASCII letters, digits, `-` and `_` only.
pub fn validate_session_id(session: &str) -> Result<(), HistoryError> {
    let ok = !session.is_empty()
        && session.len() <= MAX_SESSION_ID_LEN
        && session
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(HistoryError::InvalidSession(session.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("invalid session id: {0:?}")]
    InvalidSession(String),
    #[error("history file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed history file: {0}")]
    Json(#[from] serde_json::Error),
}
