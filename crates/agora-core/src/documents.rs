//! Reading the cached corpus: one plain-text document per file in the cache directory.
//!
//! The cache is filled by [`crate::source::DocumentSource`]; this module only reads it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

/// Metadata key holding the file name a document (and its chunks) came from.
pub const SOURCE_KEY: &str = "source";
/// File extension of corpus documents, both remote and cached.
pub const DOCUMENT_EXTENSION: &str = "txt";

/// A corpus document: file name, full text, and provenance metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// File name in the cache directory; the document's identity.
    pub name: String,
    pub text: String,
    pub metadata: BTreeMap<String, String>,
}

impl Document {
    /// Creates a document whose metadata records `name` as its source.
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        let name = name.into();
        let mut metadata = BTreeMap::new();
        metadata.insert(SOURCE_KEY.to_string(), name.clone());
        Self {
            name,
            text: text.into(),
            metadata,
        }
    }
}

/// Reads every `.txt` file directly inside `cache_dir`, ordered by file name.
/// Hidden files (including in-flight downloads) are ignored. A file that cannot be
/// read as UTF-8 text is logged and skipped.
pub fn read_corpus(cache_dir: &Path) -> Result<Vec<Document>, ScanError> {
    if !cache_dir.is_dir() {
        return Err(ScanError::NotADirectory(cache_dir.to_path_buf()));
    }
    let mut documents = Vec::new();
    for entry in WalkDir::new(cache_dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| ScanError::Walk(e.to_string()))?;
        let path = entry.path();
        if is_hidden(&entry) || !path.is_file() || !is_document_name(path) {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            warn!(path = %path.display(), "skipping document with a non UTF-8 file name");
            continue;
        };
        match std::fs::read_to_string(path) {
            Ok(text) => {
                debug!(document = name, chars = text.chars().count(), "read document");
                documents.push(Document::new(name, text));
            }
            Err(e) => warn!(document = name, error = %e, "skipping unreadable document"),
        }
    }
    Ok(documents)
}

/// True for file names with the corpus document extension.
pub fn is_document_name(name: impl AsRef<Path>) -> bool {
    name.as_ref()
        .extension()
        .is_some_and(|e| e == DOCUMENT_EXTENSION)
}

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|s| s.starts_with('.'))
        .unwrap_or(false)
}

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),
    #[error("walk error: {0}")]
    Walk(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_only_visible_text_files_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "second").unwrap();
        std::fs::write(dir.path().join("a.txt"), "first").unwrap();
        std::fs::write(dir.path().join("notes.md"), "ignored").unwrap();
        std::fs::write(dir.path().join(".partial.txt"), "ignored").unwrap();
        std::fs::write(dir.path().join("bad.txt"), [0xff, 0xfe, 0x00]).unwrap();

        let docs = read_corpus(dir.path()).unwrap();
        let names: Vec<_> = docs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["a.txt", "b.txt"]);
        assert_eq!(docs[0].text, "first");
        assert_eq!(docs[0].metadata.get(SOURCE_KEY).map(String::as_str), Some("a.txt"));
    }

    #[test]
    fn missing_cache_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_corpus(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, ScanError::NotADirectory(_)));
    }
}
