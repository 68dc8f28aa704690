//! Document source: the corpus and the persisted index as they live in the remote
//! store, mirrored into local directories.
//!
//! Layout in the remote root folder:
//! - `*.txt` files (MIME `text/plain`) are the corpus
//! - the index subfolder (default `vector_index`) holds the two index artifacts

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::documents::is_document_name;
use crate::persist::{self, ARTIFACTS, CURRENT_FILE};
use crate::remote::{FileQuery, RemoteError, RemoteFile, RemoteStore, FOLDER_MIME, TEXT_MIME};

/// Outcome of [`DocumentSource::sync_documents`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub downloaded: Vec<String>,
    pub cached: Vec<String>,
    /// Documents that could not be fetched, with the reason.
    pub failed: Vec<(String, String)>,
}

impl SyncReport {
    pub fn available(&self) -> usize {
        self.downloaded.len() + self.cached.len()
    }
}

pub struct DocumentSource {
    store: Arc<dyn RemoteStore>,
    root_folder_id: String,
    index_folder_name: String,
    cache_dir: PathBuf,
}

impl DocumentSource {
    pub fn new(store: Arc<dyn RemoteStore>, config: &Config) -> Self {
        Self {
            store,
            root_folder_id: config.remote_root_folder_id.clone(),
            index_folder_name: config.index_folder_name.clone(),
            cache_dir: config.local_cache_dir.clone(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Every `text/plain` `*.txt` file in the root folder, sorted by name. Other plain
    /// text files would never be read from the cache, so they are not listed.
    pub async fn list_available(&self) -> Result<Vec<RemoteFile>, RemoteError> {
        let mut files = self
            .store
            .list(&self.root_folder_id, &FileQuery::of_type(TEXT_MIME))
            .await?;
        files.retain(|f| {
            let keep = is_document_name(&f.name);
            if !keep {
                debug!(name = %f.name, "ignoring plain text file without the document extension");
            }
            keep
        });
        // Duplicate names share one cache file; the first listed wins.
        files.sort_by(|a, b| a.name.cmp(&b.name));
        files.dedup_by(|a, b| a.name == b.name);
        debug!(count = files.len(), "listed remote documents");
        Ok(files)
    }

    /// Folder named exactly `name` directly inside the root folder.
    pub async fn locate_folder(&self, name: &str) -> Result<Option<RemoteFile>, RemoteError> {
        let found = self
            .store
            .list(&self.root_folder_id, &FileQuery::named(name).with_type(FOLDER_MIME))
            .await?;
        Ok(found.into_iter().next())
    }

    /// Local path of `file`, downloading it first unless a file of that name is already
    /// cached. Cached files are never refreshed.
    pub async fn fetch_if_missing(&self, file: &RemoteFile) -> Result<PathBuf, RemoteError> {
        check_name(&file.name)?;
        let path = self.cache_dir.join(&file.name);
        if path.is_file() {
            debug!(name = %file.name, "document already cached");
            return Ok(path);
        }
        std::fs::create_dir_all(&self.cache_dir)?;
        let tmp = NamedTempFile::new_in(&self.cache_dir)?;
        let bytes = self.store.download_to(&file.id, tmp.path()).await?;
        tmp.persist(&path).map_err(|e| RemoteError::Io(e.error))?;
        info!(name = %file.name, bytes, "downloaded document");
        Ok(path)
    }

    /// Downloads every document not yet cached. One failing document is logged and
    /// skipped; failing to list the folder fails the sync.
    pub async fn sync_documents(&self) -> Result<SyncReport, RemoteError> {
        let mut report = SyncReport::default();
        for file in self.list_available().await? {
            let cached = self.cache_dir.join(&file.name).is_file();
            match self.fetch_if_missing(&file).await {
                Ok(_) if cached => report.cached.push(file.name),
                Ok(_) => report.downloaded.push(file.name),
                Err(e) => {
                    warn!(name = %file.name, error = %e, "skipping document");
                    report.failed.push((file.name, e.to_string()));
                }
            }
        }
        info!(
            downloaded = report.downloaded.len(),
            cached = report.cached.len(),
            failed = report.failed.len(),
            "synced documents"
        );
        Ok(report)
    }

    /// Downloads both index artifacts and publishes them as the live index in
    /// `target_dir`. Returns `false` when the index folder or either artifact does not
    /// exist remotely; the local index is untouched then, and also on any error.
    pub async fn fetch_index_artifacts(&self, target_dir: &Path) -> Result<bool, RemoteError> {
        let Some(folder) = self.locate_folder(&self.index_folder_name).await? else {
            info!(folder = %self.index_folder_name, "no remote index folder");
            return Ok(false);
        };
        let mut remote = Vec::with_capacity(ARTIFACTS.len());
        for name in ARTIFACTS {
            match self.store.list(&folder.id, &FileQuery::named(name)).await?.into_iter().next() {
                Some(file) => remote.push((name, file)),
                None => {
                    info!(artifact = name, "remote index is incomplete");
                    return Ok(false);
                }
            }
        }

        let staged = persist::stage(target_dir)?;
        for (name, file) in &remote {
            self.store.download_to(&file.id, &staged.path().join(name)).await?;
        }
        let generation = persist::commit(staged, target_dir)?;
        info!(dir = %generation.display(), "fetched remote index");
        Ok(true)
    }

    /// Uploads both artifacts of the live index in `source_dir` into the index folder,
    /// creating the folder when needed. Existing files of the same name are overwritten.
    pub async fn push_index_artifacts(&self, source_dir: &Path) -> Result<(), RemoteError> {
        let live = persist::current_dir(source_dir)
            .ok_or_else(|| RemoteError::MissingArtifact(source_dir.join(CURRENT_FILE)))?;
        let mut contents = Vec::with_capacity(ARTIFACTS.len());
        for name in ARTIFACTS {
            let path = live.join(name);
            if !path.is_file() {
                return Err(RemoteError::MissingArtifact(path));
            }
            contents.push((name, tokio::fs::read(&path).await?));
        }

        let folder = match self.locate_folder(&self.index_folder_name).await? {
            Some(folder) => folder,
            None => {
                self.store
                    .create_folder(&self.root_folder_id, &self.index_folder_name)
                    .await?
            }
        };
        for (name, content) in contents {
            let existing = self.store.list(&folder.id, &FileQuery::named(name)).await?;
            match existing.first() {
                Some(file) => self.store.update(&file.id, content).await?,
                None => {
                    self.store.create(&folder.id, name, content).await?;
                }
            }
            debug!(artifact = name, replaced = !existing.is_empty(), "pushed index artifact");
        }
        info!(folder = %self.index_folder_name, "pushed index to remote store");
        Ok(())
    }
}

/// Remote names become local file names; anything that could leave the cache
/// directory is refused.
fn check_name(name: &str) -> Result<(), RemoteError> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if bad {
        return Err(RemoteError::InvalidName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::{STORE_FILE, VECTORS_FILE};
    use crate::remote::MemoryStore;

    /// Publishes a raw pair as the live generation of `dir`.
    fn publish(dir: &Path, vectors: &str, store: &str) {
        let staged = persist::stage(dir).unwrap();
        std::fs::write(staged.path().join(VECTORS_FILE), vectors).unwrap();
        std::fs::write(staged.path().join(STORE_FILE), store).unwrap();
        persist::commit(staged, dir).unwrap();
    }

    fn setup(dir: &Path) -> (Arc<MemoryStore>, DocumentSource) {
        let store = Arc::new(MemoryStore::new());
        let config = Config {
            remote_root_folder_id: "root".to_string(),
            local_cache_dir: dir.join("cache"),
            ..Config::default()
        };
        let source = DocumentSource::new(store.clone(), &config);
        (store, source)
    }

    #[tokio::test]
    async fn lists_only_text_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let (store, source) = setup(dir.path());
        store.insert("root", "b.txt", TEXT_MIME, "b");
        store.insert("root", "a.txt", TEXT_MIME, "a");
        store.insert("root", "scan.pdf", "application/pdf", "%PDF");
        store.insert("root", "README", TEXT_MIME, "no extension");
        store.insert("root", "notes.md", TEXT_MIME, "# markdown");
        let names: Vec<_> = source
            .list_available()
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, ["a.txt", "b.txt"]);
    }

    #[tokio::test]
    async fn sync_reports_only_documents_the_corpus_reads() {
        let dir = tempfile::tempdir().unwrap();
        let (store, source) = setup(dir.path());
        store.insert("root", "a.txt", TEXT_MIME, "Alyosha");
        store.insert("root", "README", TEXT_MIME, "not a document");
        let report = source.sync_documents().await.unwrap();
        assert_eq!(report.downloaded, ["a.txt"]);
        assert_eq!(store.download_count(), 1);

        let corpus = crate::documents::read_corpus(source.cache_dir()).unwrap();
        assert_eq!(corpus.len(), report.available());
    }

    #[tokio::test]
    async fn cached_documents_are_not_downloaded_again() {
        let dir = tempfile::tempdir().unwrap();
        let (store, source) = setup(dir.path());
        store.insert("root", "a.txt", TEXT_MIME, "remote text");

        let first = source.sync_documents().await.unwrap();
        assert_eq!(first.downloaded, ["a.txt"]);
        std::fs::write(dir.path().join("cache/a.txt"), "edited locally").unwrap();

        let second = source.sync_documents().await.unwrap();
        assert_eq!(second.cached, ["a.txt"]);
        assert_eq!(store.download_count(), 1);
        let text = std::fs::read_to_string(dir.path().join("cache/a.txt")).unwrap();
        assert_eq!(text, "edited locally");
    }

    #[tokio::test]
    async fn unsafe_names_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (store, source) = setup(dir.path());
        store.insert("root", "../escape.txt", TEXT_MIME, "x");
        store.insert("root", "ok.txt", TEXT_MIME, "ok");
        let report = source.sync_documents().await.unwrap();
        assert_eq!(report.downloaded, ["ok.txt"]);
        assert_eq!(report.failed.len(), 1);
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn sync_fails_when_store_is_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let (store, source) = setup(dir.path());
        store.set_unavailable(true);
        assert!(source.sync_documents().await.is_err());
    }

    #[tokio::test]
    async fn fetch_reports_missing_folder_and_partial_index() {
        let dir = tempfile::tempdir().unwrap();
        let (store, source) = setup(dir.path());
        let target = dir.path().join("index");
        assert!(!source.fetch_index_artifacts(&target).await.unwrap());

        let folder = store.insert("root", "vector_index", FOLDER_MIME, "");
        store.insert(&folder, VECTORS_FILE, "application/octet-stream", "v");
        assert!(!source.fetch_index_artifacts(&target).await.unwrap());
        assert!(!persist::artifacts_present(&target));
    }

    #[tokio::test]
    async fn push_creates_folder_then_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let (store, source) = setup(dir.path());
        let local = dir.path().join("index");
        publish(&local, "v1", "s1");
        source.push_index_artifacts(&local).await.unwrap();

        publish(&local, "v2", "s1");
        source.push_index_artifacts(&local).await.unwrap();

        let folder = source.locate_folder("vector_index").await.unwrap().unwrap();
        assert_eq!(store.content_of(&folder.id, VECTORS_FILE).unwrap(), b"v2");
        assert_eq!(store.content_of(&folder.id, STORE_FILE).unwrap(), b"s1");
        let listed = store.list(&folder.id, &FileQuery::default()).await.unwrap();
        assert_eq!(listed.len(), 2);

        let fetched = dir.path().join("fetched");
        assert!(source.fetch_index_artifacts(&fetched).await.unwrap());
        let live = persist::current_dir(&fetched).unwrap();
        assert_eq!(std::fs::read(live.join(STORE_FILE)).unwrap(), b"s1");
        assert_eq!(std::fs::read(live.join(VECTORS_FILE)).unwrap(), b"v2");
    }

    #[tokio::test]
    async fn failed_fetch_keeps_the_local_index() {
        let dir = tempfile::tempdir().unwrap();
        let (store, source) = setup(dir.path());
        let local = dir.path().join("index");
        publish(&local, "old-v", "old-s");
        let folder = store.insert("root", "vector_index", FOLDER_MIME, "");
        store.insert(&folder, VECTORS_FILE, "application/octet-stream", "new-v");
        let store_id = store.insert(&folder, STORE_FILE, "application/octet-stream", "new-s");

        store.fail_download(&store_id);
        assert!(source.fetch_index_artifacts(&local).await.is_err());

        let live = persist::current_dir(&local).unwrap();
        assert_eq!(std::fs::read(live.join(VECTORS_FILE)).unwrap(), b"old-v");
        assert_eq!(std::fs::read(live.join(STORE_FILE)).unwrap(), b"old-s");
    }

    #[tokio::test]
    async fn push_refuses_incomplete_local_index() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, source) = setup(dir.path());
        let local = dir.path().join("index");
        assert!(matches!(
            source.push_index_artifacts(&local).await,
            Err(RemoteError::MissingArtifact(_))
        ));

        let staged = persist::stage(&local).unwrap();
        std::fs::write(staged.path().join(VECTORS_FILE), "v").unwrap();
        persist::commit(staged, &local).unwrap();
        assert!(matches!(
            source.push_index_artifacts(&local).await,
            Err(RemoteError::MissingArtifact(_))
        ));
    }
}
