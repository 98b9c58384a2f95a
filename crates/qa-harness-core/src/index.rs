//! In-memory vector index with atomic snapshot replacement.
//!
//! A [`VectorIndex`] publishes immutable [`IndexSnapshot`]s behind an
//! `RwLock<Option<Arc<_>>>`. Building a snapshot (dimension checks, norm
//! precomputation) happens without any lock; publishing is a single pointer
//! swap under the write lock. Searches clone the current `Arc` under the read
//! lock and score against it lock-free, so a reader sees either the previous
//! complete snapshot or the new one, never a mix.
//!
//! Search is brute-force cosine similarity over all stored vectors.

use std::cmp::Ordering;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::embedding::{cosine_similarity, vector_norm, DEGENERATE_NORM};
use crate::error::{QaError, QaResult};
use crate::models::{Chunk, EmbeddedChunk, RetrievalResult, ScoredChunk, SourceKind};

/// Metadata restriction applied to a search.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchFilter {
    pub source_kind: Option<SourceKind>,
}

impl SearchFilter {
    pub fn any() -> Self {
        Self { source_kind: None }
    }

    pub fn kind(kind: SourceKind) -> Self {
        Self {
            source_kind: Some(kind),
        }
    }

    fn matches(&self, chunk: &Chunk) -> bool {
        self.source_kind.map_or(true, |k| chunk.source_kind == k)
    }
}

#[derive(Debug)]
struct IndexedChunk {
    chunk: Chunk,
    vector: Vec<f32>,
    norm: f32,
}

/// An immutable, fully built set of embedded chunks.
#[derive(Debug)]
pub struct IndexSnapshot {
    dimension: usize,
    entries: Vec<IndexedChunk>,
    degenerate: usize,
}

impl IndexSnapshot {
    /// Validate and index a set of embedded chunks.
    ///
    /// # Errors
    ///
    /// [`QaError::DimensionMismatch`] if any vector's length differs from
    /// `dimension`; [`QaError::InvalidRequest`] if `dimension` is zero.
    pub fn build(embedded: Vec<EmbeddedChunk>, dimension: usize) -> QaResult<Self> {
        if dimension == 0 {
            return Err(QaError::InvalidRequest(
                "index dimension must be > 0".to_string(),
            ));
        }

        let mut entries = Vec::with_capacity(embedded.len());
        let mut degenerate_ids = Vec::new();
        for ec in embedded {
            if ec.vector.len() != dimension {
                return Err(QaError::DimensionMismatch {
                    chunk_id: ec.chunk.id,
                    expected: dimension,
                    actual: ec.vector.len(),
                });
            }
            let norm = vector_norm(&ec.vector);
            if !norm.is_finite() || norm < DEGENERATE_NORM {
                degenerate_ids.push(ec.chunk.id.clone());
            }
            entries.push(IndexedChunk {
                chunk: ec.chunk,
                vector: ec.vector,
                norm,
            });
        }

        if !degenerate_ids.is_empty() {
            tracing::warn!(
                count = degenerate_ids.len(),
                chunk_ids = ?degenerate_ids,
                "degenerate embeddings excluded from search results"
            );
        }

        Ok(Self {
            dimension,
            degenerate: degenerate_ids.len(),
            entries,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of chunks excluded from search for near-zero norm.
    pub fn degenerate_count(&self) -> usize {
        self.degenerate
    }

    pub fn count_kind(&self, kind: SourceKind) -> usize {
        self.entries
            .iter()
            .filter(|e| e.chunk.source_kind == kind)
            .count()
    }

    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.entries.iter().map(|e| &e.chunk)
    }

    /// Up to `k` nearest chunks by cosine similarity, matching `filter`.
    pub fn search(&self, query: &[f32], k: usize, filter: SearchFilter) -> QaResult<RetrievalResult> {
        if query.len() != self.dimension {
            return Err(QaError::DimensionMismatch {
                chunk_id: "<query>".to_string(),
                expected: self.dimension,
                actual: query.len(),
            });
        }
        if k == 0 {
            return Ok(RetrievalResult::default());
        }
        let query_norm = vector_norm(query);
        if !query_norm.is_finite() || query_norm < DEGENERATE_NORM {
            tracing::warn!("degenerate query embedding, returning no evidence");
            return Ok(RetrievalResult::default());
        }

        let mut scored: Vec<ScoredChunk> = self
            .entries
            .iter()
            .filter(|e| e.norm.is_finite() && e.norm >= DEGENERATE_NORM)
            .filter(|e| filter.matches(&e.chunk))
            .map(|e| ScoredChunk {
                chunk: e.chunk.clone(),
                score: cosine_similarity(query, &e.vector),
            })
            .collect();

        scored.sort_by(compare_scored);
        scored.truncate(k);
        Ok(RetrievalResult::new(scored))
    }
}

/// Descending score, then ascending sequence index, source id, chunk id.
fn compare_scored(a: &ScoredChunk, b: &ScoredChunk) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then(a.chunk.sequence_index.cmp(&b.chunk.sequence_index))
        .then(a.chunk.source_document_id.cmp(&b.chunk.source_document_id))
        .then(a.chunk.id.cmp(&b.chunk.id))
}

/// Vector index owned by one knowledge base.
#[derive(Default)]
pub struct VectorIndex {
    current: RwLock<Option<Arc<IndexSnapshot>>>,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot and publish it, replacing any previous one atomically.
    pub fn build(&self, embedded: Vec<EmbeddedChunk>, dimension: usize) -> QaResult<Arc<IndexSnapshot>> {
        let snapshot = Arc::new(IndexSnapshot::build(embedded, dimension)?);
        self.publish(snapshot.clone());
        Ok(snapshot)
    }

    /// Swap in a prebuilt snapshot.
    pub fn publish(&self, snapshot: Arc<IndexSnapshot>) {
        *self.current.write() = Some(snapshot);
    }

    /// Drop the published snapshot.
    pub fn clear(&self) {
        *self.current.write() = None;
    }

    /// The currently published snapshot, if any.
    pub fn snapshot(&self) -> Option<Arc<IndexSnapshot>> {
        self.current.read().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.current.read().is_some()
    }

    /// Search the current snapshot.
    ///
    /// # Errors
    ///
    /// [`QaError::IndexNotReady`] when nothing has been published.
    pub fn search(&self, query: &[f32], k: usize, filter: SearchFilter) -> QaResult<RetrievalResult> {
        let snapshot = self.snapshot().ok_or(QaError::IndexNotReady)?;
        snapshot.search(query, k, filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CharSpan;

    fn chunk(id: &str, doc: &str, seq: usize, kind: SourceKind) -> Chunk {
        Chunk {
            id: id.to_string(),
            text: format!("text of {}", id),
            source_document_id: doc.to_string(),
            source_kind: kind,
            sequence_index: seq,
            char_span: CharSpan { start: 0, end: 1 },
            element_selectors: None,
            hash: String::new(),
        }
    }

    fn embedded(id: &str, doc: &str, seq: usize, kind: SourceKind, v: &[f32]) -> EmbeddedChunk {
        EmbeddedChunk {
            chunk: chunk(id, doc, seq, kind),
            vector: v.to_vec(),
        }
    }

    #[test]
    fn test_search_before_build_not_ready() {
        let index = VectorIndex::new();
        let err = index.search(&[1.0, 0.0], 3, SearchFilter::any()).unwrap_err();
        assert!(matches!(err, QaError::IndexNotReady));
    }

    #[test]
    fn test_search_orders_by_score() {
        let index = VectorIndex::new();
        index
            .build(
                vec![
                    embedded("a", "d1", 0, SourceKind::Doc, &[1.0, 0.0]),
                    embedded("b", "d1", 1, SourceKind::Doc, &[0.7, 0.7]),
                    embedded("c", "d1", 2, SourceKind::Doc, &[0.0, 1.0]),
                ],
                2,
            )
            .unwrap();
        let result = index.search(&[1.0, 0.1], 2, SearchFilter::any()).unwrap();
        let ids: Vec<_> = result.chunks().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(result.items[0].score >= result.items[1].score);
    }

    #[test]
    fn test_ties_broken_deterministically() {
        let index = VectorIndex::new();
        index
            .build(
                vec![
                    embedded("z", "doc-b", 1, SourceKind::Doc, &[1.0, 0.0]),
                    embedded("y", "doc-b", 0, SourceKind::Doc, &[1.0, 0.0]),
                    embedded("x", "doc-a", 1, SourceKind::Doc, &[1.0, 0.0]),
                ],
                2,
            )
            .unwrap();
        let first = index.search(&[2.0, 0.0], 10, SearchFilter::any()).unwrap();
        let ids: Vec<_> = first.chunks().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["y", "x", "z"]);
        let second = index.search(&[2.0, 0.0], 10, SearchFilter::any()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_filter_by_kind() {
        let index = VectorIndex::new();
        index
            .build(
                vec![
                    embedded("doc", "d", 0, SourceKind::Doc, &[1.0, 0.0]),
                    embedded("ui", "page", 0, SourceKind::Markup, &[0.5, 0.5]),
                ],
                2,
            )
            .unwrap();
        let result = index
            .search(&[1.0, 0.0], 5, SearchFilter::kind(SourceKind::Markup))
            .unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result.items[0].chunk.id, "ui");
    }

    #[test]
    fn test_degenerate_vectors_excluded() {
        let index = VectorIndex::new();
        let snapshot = index
            .build(
                vec![
                    embedded("zero", "d", 0, SourceKind::Doc, &[0.0, 0.0]),
                    embedded("ok", "d", 1, SourceKind::Doc, &[0.0, 1.0]),
                ],
                2,
            )
            .unwrap();
        assert_eq!(snapshot.degenerate_count(), 1);
        let result = index.search(&[0.0, 1.0], 5, SearchFilter::any()).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result.items[0].chunk.id, "ok");
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let index = VectorIndex::new();
        let err = index
            .build(vec![embedded("a", "d", 0, SourceKind::Doc, &[1.0, 0.0, 0.0])], 2)
            .unwrap_err();
        assert!(matches!(err, QaError::DimensionMismatch { expected: 2, actual: 3, .. }));
        assert!(!index.is_ready());
    }

    #[test]
    fn test_rebuild_replaces_snapshot() {
        let index = VectorIndex::new();
        index
            .build(vec![embedded("old", "d", 0, SourceKind::Doc, &[1.0, 0.0])], 2)
            .unwrap();
        let held = index.snapshot().unwrap();
        index
            .build(vec![embedded("new", "d", 0, SourceKind::Doc, &[1.0, 0.0])], 2)
            .unwrap();
        assert_eq!(held.chunks().next().unwrap().id, "old");
        let result = index.search(&[1.0, 0.0], 5, SearchFilter::any()).unwrap();
        assert_eq!(result.items[0].chunk.id, "new");
        index.clear();
        assert!(!index.is_ready());
    }
}
