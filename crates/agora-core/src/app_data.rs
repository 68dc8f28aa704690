//! Where Agora stores its own data (config, document cache, index, chat history).
//!
//! Every location can be overridden in the config; these are only the defaults.

use std::path::PathBuf;

/// Returns the directory where Agora stores config, cache, index, and history.
/// On Linux: `~/.local/share/agora/`.
/// Creates the directory if it doesn't exist; returns `None` if we can't determine the path.
pub fn app_data_dir() -> Option<PathBuf> {
    let dir = directories::ProjectDirs::from("app", "Agora", "Agora")?.data_local_dir().to_path_buf();
    std::fs::create_dir_all(&dir).ok()?;
    Some(dir)
}

/// Base directory for the defaults below. Falls back to the working directory.
fn base_dir() -> PathBuf {
    app_data_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// Local cache of corpus documents, one plain-text file per remote file.
pub fn default_cache_dir() -> PathBuf {
    base_dir().join("documents")
}

/// Directory holding the two persisted index artifacts.
pub fn default_index_dir() -> PathBuf {
    base_dir().join("vector_index")
}

/// Per-session chat history files.
pub fn default_history_dir() -> PathBuf {
    base_dir().join("chat_sessions")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_dirs_are_distinct() {
        let dirs = [default_cache_dir(), default_index_dir(), default_history_dir()];
        assert_ne!(dirs[0], dirs[1]);
        assert_ne!(dirs[1], dirs[2]);
        assert!(dirs[1].ends_with("vector_index"));
    }
}
