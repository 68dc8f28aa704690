//! In-memory vector index over chunk embeddings: batch insert, merge, and top-k search.
//!
//! Search is exact (every entry is scored), which makes it a flat nearest-neighbor
//! index. Persistence lives in [`crate::persist`].

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::chunks::Chunk;

/// Similarity metric, fixed for the lifetime of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Cosine similarity; vectors are stored unit-normalized.
    #[default]
    Cosine,
    /// Euclidean distance `d`, reported as the similarity `1 / (1 + d)`.
    L2,
}

impl Metric {
    pub(crate) fn code(self) -> u8 {
        match self {
            Metric::Cosine => 1,
            Metric::L2 => 2,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Metric::Cosine),
            2 => Some(Metric::L2),
            _ => None,
        }
    }

    /// Vector as stored in the index.
    fn prepare(self, v: Vec<f32>) -> Vec<f32> {
        match self {
            Metric::Cosine => normalize(v),
            Metric::L2 => v,
        }
    }

    /// Similarity of a prepared query to a stored vector; higher is closer.
    fn score(self, query: &[f32], stored: &[f32]) -> f32 {
        match self {
            Metric::Cosine => dot(query, stored),
            Metric::L2 => {
                let d: f32 = query
                    .iter()
                    .zip(stored)
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum::<f32>()
                    .sqrt();
                1.0 / (1.0 + d)
            }
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Metric::Cosine => "cosine",
            Metric::L2 => "l2",
        })
    }
}

/// Metric and dimension an index was built with. Two indexes can only be merged, and
/// a persisted index only loaded, when these agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSpec {
    pub metric: Metric,
    pub dimensions: usize,
}

impl fmt::Display for IndexSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}d", self.metric, self.dimensions)
    }
}

/// One hit of a top-k query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub id: u64,
    pub chunk: Chunk,
    pub score: f32,
}

#[derive(Debug, Clone)]
pub(crate) struct Entry {
    pub(crate) id: u64,
    pub(crate) vector: Vec<f32>,
    pub(crate) chunk: Chunk,
}

/// Vector index: id → (embedding, chunk). Ids are assigned in insertion order and never
/// reused within one in-memory index.
#[derive(Debug, Clone)]
pub struct VectorIndex {
    spec: IndexSpec,
    entries: Vec<Entry>,
    next_id: u64,
}

impl VectorIndex {
    pub fn new(spec: IndexSpec) -> Self {
        Self {
            spec,
            entries: Vec::new(),
            next_id: 0,
        }
    }

    /// Builds an index from parallel chunks and embeddings. Entries are inserted into
    /// sub-indexes of `batch_size` which are merged one by one into the result.
    pub fn build(
        spec: IndexSpec,
        chunks: Vec<Chunk>,
        embeddings: Vec<Vec<f32>>,
        batch_size: usize,
    ) -> Result<Self, IndexError> {
        if chunks.len() != embeddings.len() {
            return Err(IndexError::LengthMismatch {
                chunks: chunks.len(),
                embeddings: embeddings.len(),
            });
        }
        let batch_size = batch_size.max(1);
        let batches = chunks.len().div_ceil(batch_size);
        let mut chunks = chunks.into_iter();
        let mut embeddings = embeddings.into_iter();
        let mut acc = VectorIndex::new(spec);
        for batch in 0..batches {
            let mut sub = VectorIndex::new(spec);
            sub.add_batch(
                chunks.by_ref().take(batch_size).collect(),
                embeddings.by_ref().take(batch_size).collect(),
            )?;
            acc.merge(sub)?;
            info!(batch = batch + 1, batches, entries = acc.len(), "merged index batch");
        }
        Ok(acc)
    }

    pub(crate) fn from_parts(spec: IndexSpec, entries: Vec<Entry>, next_id: u64) -> Self {
        Self {
            spec,
            entries,
            next_id,
        }
    }

    pub(crate) fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id
    }

    pub fn spec(&self) -> IndexSpec {
        self.spec
    }

    /// Add a chunk with its embedding. Returns the id assigned to the entry.
    pub fn add(&mut self, chunk: Chunk, embedding: Vec<f32>) -> Result<u64, IndexError> {
        if embedding.len() != self.spec.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.spec.dimensions,
                actual: embedding.len(),
            });
        }
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(Entry {
            id,
            vector: self.spec.metric.prepare(embedding),
            chunk,
        });
        Ok(id)
    }

    /// Add multiple chunks with embeddings in one batch. Nothing is inserted if any
    /// embedding has the wrong dimension.
    pub fn add_batch(
        &mut self,
        chunks: Vec<Chunk>,
        embeddings: Vec<Vec<f32>>,
    ) -> Result<Vec<u64>, IndexError> {
        if chunks.len() != embeddings.len() {
            return Err(IndexError::LengthMismatch {
                chunks: chunks.len(),
                embeddings: embeddings.len(),
            });
        }
        if let Some(bad) = embeddings.iter().find(|e| e.len() != self.spec.dimensions) {
            return Err(IndexError::DimensionMismatch {
                expected: self.spec.dimensions,
                actual: bad.len(),
            });
        }
        chunks
            .into_iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| self.add(chunk, embedding))
            .collect()
    }

    /// Moves every entry of `other` into this index under fresh ids.
    pub fn merge(&mut self, other: VectorIndex) -> Result<(), IndexError> {
        if other.spec != self.spec {
            return Err(IndexError::Incompatible {
                this: self.spec,
                other: other.spec,
            });
        }
        self.entries.reserve(other.entries.len());
        for entry in other.entries {
            // Already prepared for this metric by `other`.
            self.entries.push(Entry {
                id: self.next_id,
                ..entry
            });
            self.next_id += 1;
        }
        Ok(())
    }

    /// Returns up to `k` entries closest to `query`, best first. Equal scores are
    /// ordered by id. A query of the wrong dimension matches nothing.
    pub fn top_k(&self, query: &[f32], k: usize) -> Vec<RetrievalResult> {
        if self.entries.is_empty() || k == 0 {
            return Vec::new();
        }
        if query.len() != self.spec.dimensions {
            warn!(
                expected = self.spec.dimensions,
                actual = query.len(),
                "query dimension does not match index"
            );
            return Vec::new();
        }
        let query = self.spec.metric.prepare(query.to_vec());
        let mut scored: Vec<(&Entry, f32)> = self
            .entries
            .iter()
            .map(|e| {
                let score = self.spec.metric.score(&query, &e.vector);
                // NaN (from a non-finite vector) ranks below every real score.
                (e, if score.is_nan() { f32::NEG_INFINITY } else { score })
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.id.cmp(&b.0.id)));
        scored.truncate(k);
        debug!(k, hits = scored.len(), "top-k search");
        scored
            .into_iter()
            .map(|(e, score)| RetrievalResult {
                id: e.id,
                chunk: e.chunk.clone(),
                score,
            })
            .collect()
    }

    /// Chunk and stored vector for `id`.
    pub fn get(&self, id: u64) -> Option<(&Chunk, &[f32])> {
        self.entries
            .iter()
            .find(|e| e.id == id)
            .map(|e| (&e.chunk, e.vector.as_slice()))
    }

    /// Number of indexed chunks.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
    v
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("vector dimension mismatch: index expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("{chunks} chunks but {embeddings} embeddings")]
    LengthMismatch { chunks: usize, embeddings: usize },
    #[error("cannot merge a {other} index into a {this} index")]
    Incompatible { this: IndexSpec, other: IndexSpec },
    #[error("index artifacts in {dir} are unusable: {reason}")]
    Deserialization { dir: PathBuf, reason: String },
    #[error("failed to write index: {0}")]
    Write(#[from] std::io::Error),
    #[error("failed to encode index: {0}")]
    Encode(#[from] bincode::error::EncodeError),
}
