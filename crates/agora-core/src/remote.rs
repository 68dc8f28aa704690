//! Remote file store interface: folders and files addressed by opaque ids, looked up
//! by parent folder plus name/MIME filters.
//!
//! [`crate::drive::DriveStore`] talks to Google Drive; [`MemoryStore`] keeps everything
//! in memory for development and tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub const TEXT_MIME: &str = "text/plain";
pub const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

/// A file or folder in the remote store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
}

/// Filters for [`RemoteStore::list`]. Trashed files are never listed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileQuery {
    /// Exact name match.
    pub name: Option<String>,
    pub mime_type: Option<String>,
}

impl FileQuery {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            mime_type: None,
        }
    }

    pub fn of_type(mime_type: impl Into<String>) -> Self {
        Self {
            name: None,
            mime_type: Some(mime_type.into()),
        }
    }

    pub fn with_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Files directly inside `parent` that match `query`.
    async fn list(&self, parent: &str, query: &FileQuery) -> Result<Vec<RemoteFile>, RemoteError>;

    /// Streams the content of `file_id` into `dest`, replacing it. Returns bytes written.
    async fn download_to(&self, file_id: &str, dest: &Path) -> Result<u64, RemoteError>;

    /// Creates a new file named `name` in `parent`.
    async fn create(&self, parent: &str, name: &str, content: Vec<u8>) -> Result<RemoteFile, RemoteError>;

    /// Replaces the content of an existing file.
    async fn update(&self, file_id: &str, content: Vec<u8>) -> Result<(), RemoteError>;

    async fn create_folder(&self, parent: &str, name: &str) -> Result<RemoteFile, RemoteError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("remote store credentials are invalid: {0}")]
    Credentials(String),
    #[error("remote store authentication failed: {0}")]
    Auth(String),
    #[error("remote store request failed: {0}")]
    Request(String),
    #[error("remote store returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("remote file not found: {0}")]
    NotFound(String),
    #[error("refusing unsafe remote file name: {0:?}")]
    InvalidName(String),
    #[error("local artifact missing: {0}")]
    MissingArtifact(PathBuf),
    #[error("local file error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
struct StoredFile {
    file: RemoteFile,
    parent: String,
    mime_type: String,
    content: Vec<u8>,
}

/// In-memory [`RemoteStore`]. Ids are sequential (`f1`, `f2`, …).
#[derive(Debug, Default)]
pub struct MemoryStore {
    files: Mutex<Vec<StoredFile>>,
    next_id: AtomicUsize,
    downloads: AtomicUsize,
    unavailable: AtomicBool,
    broken: Mutex<Vec<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a file and returns its id.
    pub fn insert(&self, parent: &str, name: &str, mime_type: &str, content: impl Into<Vec<u8>>) -> String {
        let id = format!("f{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.lock().push(StoredFile {
            file: RemoteFile {
                id: id.clone(),
                name: name.to_string(),
            },
            parent: parent.to_string(),
            mime_type: mime_type.to_string(),
            content: content.into(),
        });
        id
    }

    /// Makes every call fail as if the store were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes downloads of `file_id` fail while listing still shows it.
    pub fn fail_download(&self, file_id: &str) {
        self.broken
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(file_id.to_string());
    }

    /// Number of successful downloads so far.
    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    /// Content of the file named `name` in `parent`.
    pub fn content_of(&self, parent: &str, name: &str) -> Option<Vec<u8>> {
        self.lock()
            .iter()
            .find(|f| f.parent == parent && f.file.name == name)
            .map(|f| f.content.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<StoredFile>> {
        self.files.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(&self) -> Result<(), RemoteError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RemoteError::Request("store is unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn list(&self, parent: &str, query: &FileQuery) -> Result<Vec<RemoteFile>, RemoteError> {
        self.check_available()?;
        Ok(self
            .lock()
            .iter()
            .filter(|f| f.parent == parent)
            .filter(|f| query.name.as_ref().map_or(true, |n| *n == f.file.name))
            .filter(|f| query.mime_type.as_ref().map_or(true, |m| *m == f.mime_type))
            .map(|f| f.file.clone())
            .collect())
    }

    async fn download_to(&self, file_id: &str, dest: &Path) -> Result<u64, RemoteError> {
        self.check_available()?;
        let broken = self
            .broken
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .any(|id| id == file_id);
        if broken {
            return Err(RemoteError::Request(format!("download of {file_id} interrupted")));
        }
        let content = self
            .lock()
            .iter()
            .find(|f| f.file.id == file_id)
            .map(|f| f.content.clone())
            .ok_or_else(|| RemoteError::NotFound(file_id.to_string()))?;
        tokio::fs::write(dest, &content).await?;
        self.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(content.len() as u64)
    }

    async fn create(&self, parent: &str, name: &str, content: Vec<u8>) -> Result<RemoteFile, RemoteError> {
        self.check_available()?;
        let id = self.insert(parent, name, "application/octet-stream", content);
        Ok(RemoteFile {
            id,
            name: name.to_string(),
        })
    }

    async fn update(&self, file_id: &str, content: Vec<u8>) -> Result<(), RemoteError> {
        self.check_available()?;
        let mut files = self.lock();
        let file = files
            .iter_mut()
            .find(|f| f.file.id == file_id)
            .ok_or_else(|| RemoteError::NotFound(file_id.to_string()))?;
        file.content = content;
        Ok(())
    }

    async fn create_folder(&self, parent: &str, name: &str) -> Result<RemoteFile, RemoteError> {
        self.check_available()?;
        let id = self.insert(parent, name, FOLDER_MIME, Vec::<u8>::new());
        Ok(RemoteFile {
            id,
            name: name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn list_filters_by_parent_name_and_type() {
        let store = MemoryStore::new();
        store.insert("root", "a.txt", TEXT_MIME, "a");
        store.insert("root", "b.pdf", "application/pdf", "b");
        store.insert("other", "c.txt", TEXT_MIME, "c");

        let texts = store.list("root", &FileQuery::of_type(TEXT_MIME)).await.unwrap();
        assert_eq!(texts.len(), 1);
        assert_eq!(texts[0].name, "a.txt");
        let named = store.list("root", &FileQuery::named("b.pdf")).await.unwrap();
        assert_eq!(named.len(), 1);
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.list("root", &FileQuery::default()).await,
            Err(RemoteError::Request(_))
        ));
    }
}
