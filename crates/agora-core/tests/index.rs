//! Vector index behavior through the public API: merge, search, persistence, and the
//! build pipeline on a small corpus.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use agora_core::persist::{self, STORE_FILE, VECTORS_FILE};
use agora_core::{
    build_index, Chunk, ChunkParams, Document, EmbeddingGateway, IndexError, IndexSpec, Metric,
    VectorIndex,
};
use common::{VocabularyEmbedder, INQUISITOR, VOCABULARY};

fn chunk(text: &str) -> Chunk {
    Chunk {
        text: text.to_string(),
        metadata: BTreeMap::new(),
    }
}

const L2_3D: IndexSpec = IndexSpec {
    metric: Metric::L2,
    dimensions: 3,
};

/// Five points on the x axis at 0, 1, 2, 3, 4.
fn five_points() -> VectorIndex {
    let mut index = VectorIndex::new(L2_3D);
    for x in 0..5 {
        index.add(chunk(&format!("p{x}")), vec![x as f32, 0.0, 0.0]).unwrap();
    }
    index
}

fn texts(hits: &[agora_core::RetrievalResult]) -> Vec<&str> {
    hits.iter().map(|h| h.chunk.text.as_str()).collect()
}

#[test]
fn top_k_on_known_vectors() {
    let index = five_points();
    let hits = index.top_k(&[2.9, 0.0, 0.0], 3);
    assert_eq!(texts(&hits), ["p3", "p2", "p4"]);
    assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    assert!((hits[0].score - 1.0 / 1.1).abs() < 1e-5);
}

#[test]
fn stored_vector_is_its_own_best_match() {
    let index = five_points();
    for x in 0..5 {
        let hits = index.top_k(&[x as f32, 0.0, 0.0], 1);
        assert_eq!(texts(&hits), [format!("p{x}").as_str()]);
        assert_eq!(hits[0].score, 1.0);
    }

    let mut cosine = VectorIndex::new(IndexSpec {
        metric: Metric::Cosine,
        dimensions: 3,
    });
    let directions = [[1.0, 0.0, 0.0], [0.0, 2.0, 0.0], [0.0, 0.0, 3.0], [1.0, 1.0, 0.0], [0.5, -1.0, 2.0]];
    for (i, v) in directions.iter().enumerate() {
        cosine.add(chunk(&format!("d{i}")), v.to_vec()).unwrap();
    }
    for (i, v) in directions.iter().enumerate() {
        let hits = cosine.top_k(v, 1);
        assert_eq!(hits[0].id, i as u64);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }
}

#[test]
fn k_beyond_size_returns_everything_and_empty_returns_nothing() {
    let index = five_points();
    assert_eq!(index.top_k(&[0.0, 0.0, 0.0], 50).len(), 5);
    assert!(VectorIndex::new(L2_3D).top_k(&[0.0, 0.0, 0.0], 4).is_empty());
}

#[test]
fn merge_keeps_every_entry() {
    let mut left = five_points();
    let mut right = VectorIndex::new(L2_3D);
    for i in 0..3 {
        right.add(chunk(&format!("q{i}")), vec![0.0, i as f32, 1.0]).unwrap();
    }
    left.merge(right).unwrap();
    assert_eq!(left.len(), 8);

    let all = left.top_k(&[0.0, 0.0, 0.0], 8);
    let mut ids: Vec<u64> = all.iter().map(|h| h.id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 8);
    let mut names = texts(&all);
    names.sort_unstable();
    assert_eq!(names, ["p0", "p1", "p2", "p3", "p4", "q0", "q1", "q2"]);
}

#[test]
fn merge_rejects_other_metric() {
    let mut left = five_points();
    let right = VectorIndex::new(IndexSpec {
        metric: Metric::Cosine,
        dimensions: 3,
    });
    assert!(matches!(left.merge(right), Err(IndexError::Incompatible { .. })));
}

#[test]
fn save_then_load_answers_identically() {
    let dir = tempfile::tempdir().unwrap();
    let index = five_points();
    persist::save(&index, dir.path()).unwrap();
    let loaded = persist::load(dir.path(), L2_3D).unwrap();

    for query in [[0.4, 0.0, 0.0], [3.6, 1.0, 0.0], [-2.0, 0.0, 5.0]] {
        assert_eq!(index.top_k(&query, 5), loaded.top_k(&query, 5));
    }
}

#[test]
fn mixed_saves_are_rejected() {
    let first = tempfile::tempdir().unwrap();
    let second = tempfile::tempdir().unwrap();
    persist::save(&five_points(), first.path()).unwrap();
    persist::save(&five_points(), second.path()).unwrap();
    let live = |dir: &tempfile::TempDir| persist::current_dir(dir.path()).unwrap().join(STORE_FILE);
    std::fs::copy(live(&second), live(&first)).unwrap();

    let err = persist::load(first.path(), L2_3D).unwrap_err();
    assert!(matches!(err, IndexError::Deserialization { .. }));
    assert!(err.to_string().contains("different saves"));
}

#[test]
fn load_checks_expected_spec() {
    let dir = tempfile::tempdir().unwrap();
    persist::save(&five_points(), dir.path()).unwrap();
    let expected = IndexSpec {
        metric: Metric::L2,
        dimensions: 4,
    };
    assert!(matches!(
        persist::load(dir.path(), expected),
        Err(IndexError::Deserialization { .. })
    ));
}

#[test]
fn truncated_vectors_file_is_a_deserialization_error() {
    let dir = tempfile::tempdir().unwrap();
    persist::save(&five_points(), dir.path()).unwrap();
    let path = persist::current_dir(dir.path()).unwrap().join(VECTORS_FILE);
    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&path, &bytes[..bytes.len() - 7]).unwrap();
    assert!(matches!(
        persist::load(dir.path(), L2_3D),
        Err(IndexError::Deserialization { .. })
    ));
}

#[tokio::test]
async fn inquisitor_document_end_to_end() {
    let gateway = EmbeddingGateway::new(Arc::new(VocabularyEmbedder::default()), 2);
    let spec = IndexSpec {
        metric: Metric::Cosine,
        dimensions: VOCABULARY.len(),
    };
    let params = ChunkParams::new(20, 5);
    let documents = [Document::new("inquisitor.txt", INQUISITOR)];

    let chunks = agora_core::chunk_documents(&documents, &params);
    assert!(chunks.len() >= 2);
    assert!(chunks.iter().all(|c| c.text.chars().count() <= 20));
    for pair in chunks.windows(2) {
        let prev: Vec<char> = pair[0].text.chars().collect();
        let tail: String = prev[prev.len() - 5..].iter().collect();
        assert!(pair[1].text.starts_with(&tail));
    }

    let index = build_index(&documents, &params, &gateway, spec, 3).await.unwrap();
    assert_eq!(index.len(), chunks.len());

    let query = gateway.embed_query("freedom").await.unwrap();
    let best = index.top_k(&query, 1);
    assert_eq!(best.len(), 1);
    assert!(best[0].chunk.text.contains("freedom"));
    assert_eq!(best[0].chunk.source(), Some("inquisitor.txt"));
}
