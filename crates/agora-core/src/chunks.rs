//! Splits documents into overlapping chunks for embedding and search.
//!
//! Cuts prefer paragraph boundaries, then sentence ends, then spaces, and fall back
//! to a hard cut. Consecutive chunks of one document always share exactly `overlap`
//! characters, so dropping that prefix from every chunk but the first gives back the
//! original text. Lengths are counted in `char`s, never bytes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::documents::{Document, SOURCE_KEY};

/// Default maximum characters per chunk.
pub const DEFAULT_MAX_CHARS: usize = 1000;
/// Default characters shared by consecutive chunks.
pub const DEFAULT_OVERLAP: usize = 200;
/// Default value of the corpus author tag.
pub const DEFAULT_AUTHOR: &str = "Dostoevsky";

pub const AUTHOR_KEY: &str = "author";
pub const CHUNK_INDEX_KEY: &str = "chunk_index";

/// Cut-point candidates, coarsest first. A cut is allowed right before or right after
/// any separator in the group.
const SEPARATOR_GROUPS: &[&[&str]] = &[&["\n\n"], &[". ", "! ", "? ", "\n"], &[" "]];

/// A span of a document's text with the document's metadata plus the author tag and
/// its position in the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,
    pub metadata: BTreeMap<String, String>,
}

impl Chunk {
    /// File name of the document this chunk was cut from, if recorded.
    pub fn source(&self) -> Option<&str> {
        self.metadata.get(SOURCE_KEY).map(String::as_str)
    }
}

/// Chunking parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkParams {
    pub max_chars: usize,
    pub overlap: usize,
    /// Static tag added to every chunk's metadata under [`AUTHOR_KEY`].
    pub author: String,
}

impl Default for ChunkParams {
    fn default() -> Self {
        Self {
            max_chars: DEFAULT_MAX_CHARS,
            overlap: DEFAULT_OVERLAP,
            author: DEFAULT_AUTHOR.to_string(),
        }
    }
}

impl ChunkParams {
    pub fn new(max_chars: usize, overlap: usize) -> Self {
        Self {
            max_chars,
            overlap,
            ..Self::default()
        }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }
}

/// Chunk a single document.
pub fn chunk_document(document: &Document, params: &ChunkParams) -> Vec<Chunk> {
    split_text(&document.text, params.max_chars, params.overlap)
        .into_iter()
        .enumerate()
        .map(|(i, text)| {
            let mut metadata = document.metadata.clone();
            metadata.insert(AUTHOR_KEY.to_string(), params.author.clone());
            metadata.insert(CHUNK_INDEX_KEY.to_string(), i.to_string());
            Chunk { text, metadata }
        })
        .collect()
}

/// Chunk all documents. Returns chunks from all documents in order.
pub fn chunk_documents(documents: &[Document], params: &ChunkParams) -> Vec<Chunk> {
    documents
        .iter()
        .flat_map(|d| chunk_document(d, params))
        .collect()
}

/// Splits `text` into pieces of at most `max_chars` characters where each piece after
/// the first starts with the last `overlap` characters of the previous one.
///
/// `overlap` is clamped below `max_chars`. `max_chars == 0` returns the whole text.
pub fn split_text(text: &str, max_chars: usize, overlap: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    if max_chars == 0 {
        return vec![text.to_string()];
    }
    let overlap = overlap.min(max_chars - 1);

    // Byte offset of every char boundary, text.len() included.
    let bounds: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let total = bounds.len() - 1;
    // Number of content chars before each char position.
    let mut content = Vec::with_capacity(total + 1);
    content.push(0);
    for c in text.chars() {
        let last = content[content.len() - 1];
        content.push(last + usize::from(is_content(c)));
    }

    let mut pieces = Vec::new();
    let mut start = 0;
    loop {
        if total - start <= max_chars {
            pieces.push(text[bounds[start]..].to_string());
            break;
        }
        let limit = start + max_chars;
        // The cut must leave more than `overlap` chars so the next start moves forward.
        let floor = start + overlap + 1;
        let window = Window {
            floor,
            limit,
            fresh: start + overlap,
        };
        let end = find_cut(text, &bounds, &content, window).unwrap_or(limit);
        pieces.push(text[bounds[start]..bounds[end]].to_string());
        start = end - overlap;
    }
    pieces
}

/// Char positions a cut may land on, and where the text new to this piece begins.
#[derive(Clone, Copy)]
struct Window {
    floor: usize,
    limit: usize,
    fresh: usize,
}

/// Latest char position in `floor..=limit` that sits next to a separator, trying the
/// coarsest separator group first. A cut whose new text holds nothing but separator
/// chars is skipped; the next window would only re-cut the same separator.
fn find_cut(text: &str, bounds: &[usize], content: &[usize], window: Window) -> Option<usize> {
    SEPARATOR_GROUPS.iter().find_map(|group| {
        (window.floor..=window.limit).rev().find(|&pos| {
            if content[pos] == content[window.fresh] {
                return false;
            }
            let (before, after) = text.split_at(bounds[pos]);
            group
                .iter()
                .any(|sep| before.ends_with(sep) || after.starts_with(sep))
        })
    })
}

fn is_content(c: char) -> bool {
    !c.is_whitespace() && !matches!(c, '.' | '!' | '?')
}
