//! Knowledge base lifecycle: chunk, embed, index, publish.
//!
//! ```text
//!   Empty ──build──► Building ──ok──► Ready
//!                       │   ▲           │
//!                       │   └──build────┘
//!                       └──err──► Failed ──build──► Building
//! ```
//!
//! At most one build runs per knowledge base; a second request while one is
//! running fails with [`QaError::BuildInProgress`] instead of queueing. A
//! build publishes its index with a single snapshot swap after every
//! embedding has arrived, so readers only ever see a complete index.
//!
//! While a previously Ready knowledge base is rebuilding, queries are served
//! from the last published snapshot. A failed build clears the snapshot; a
//! cancelled build leaves the previous state and snapshot untouched.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use qa_harness_core::chunk::{chunk, ChunkSource};
use qa_harness_core::index::{IndexSnapshot, VectorIndex};
use qa_harness_core::markup::MarkupNode;
use qa_harness_core::models::{Chunk, EmbeddedChunk, KbState, SourceDocument, SourceKind};
use qa_harness_core::{QaError, QaResult};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::ChunkingConfig;
use crate::embedding::Embedder;

/// The structural tree of the target page, with its source id.
#[derive(Debug, Clone)]
pub struct MarkupPage {
    pub id: String,
    pub root: MarkupNode,
}

/// What one successful build produced.
#[derive(Debug, Clone, Serialize)]
pub struct BuildSummary {
    pub documents: usize,
    pub doc_chunks: usize,
    pub markup_chunks: usize,
    pub degenerate_chunks: usize,
    pub dimension: usize,
    pub embedding_model: String,
    pub duration_ms: u64,
    pub built_at: DateTime<Utc>,
}

/// Point-in-time view of a knowledge base, as reported by the API.
#[derive(Debug, Clone, Serialize)]
pub struct KbStatus {
    pub id: String,
    pub state: KbState,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<BuildSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

struct Status {
    state: KbState,
    summary: Option<BuildSummary>,
    last_error: Option<String>,
}

pub struct KnowledgeBase {
    id: String,
    created_at: DateTime<Utc>,
    status: RwLock<Status>,
    building: AtomicBool,
    index: VectorIndex,
}

/// Ends a build however it ends. Clears the build flag and, unless the build
/// recorded its own outcome, puts back the state it started from. A build
/// future dropped mid-flight therefore behaves like a cancelled one.
struct BuildGuard<'a> {
    kb: &'a KnowledgeBase,
    prior: KbState,
    settled: bool,
}

impl Drop for BuildGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.kb.status.write().state = self.prior;
            tracing::info!(
                knowledge_base = %self.kb.id,
                state = %self.prior,
                "knowledge base build abandoned"
            );
        }
        self.kb.building.store(false, Ordering::Release);
    }
}

impl KnowledgeBase {
    /// A new, Empty knowledge base.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at: Utc::now(),
            status: RwLock::new(Status {
                state: KbState::Empty,
                summary: None,
                last_error: None,
            }),
            building: AtomicBool::new(false),
            index: VectorIndex::new(),
        }
    }

    /// A new knowledge base with a random id.
    pub fn with_random_id() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> KbState {
        self.status.read().state
    }

    pub fn status(&self) -> KbStatus {
        let status = self.status.read();
        KbStatus {
            id: self.id.clone(),
            state: status.state,
            created_at: self.created_at,
            summary: status.summary.clone(),
            last_error: status.last_error.clone(),
        }
    }

    /// The snapshot queries should read.
    ///
    /// Ready knowledge bases serve their published snapshot; a rebuild of a
    /// previously Ready knowledge base keeps serving the previous one.
    pub fn query_snapshot(&self) -> QaResult<Arc<IndexSnapshot>> {
        let state = self.state();
        let snapshot = match state {
            KbState::Ready | KbState::Building => self.index.snapshot(),
            KbState::Empty | KbState::Failed => None,
        };
        snapshot.ok_or_else(|| QaError::KnowledgeBaseNotReady {
            knowledge_base_id: self.id.clone(),
            state,
        })
    }

    /// Build (or rebuild) from fresh inputs.
    ///
    /// # Errors
    ///
    /// - [`QaError::BuildInProgress`] if another build is running.
    /// - [`QaError::InvalidRequest`] if there is nothing to index.
    /// - [`QaError::Chunking`], [`QaError::EmbeddingUnavailable`],
    ///   [`QaError::DimensionMismatch`] from the build stages; the knowledge
    ///   base is left Failed.
    /// - [`QaError::Cancelled`]; the knowledge base keeps its prior state.
    pub async fn build(
        &self,
        documents: &[SourceDocument],
        markup: Option<&MarkupPage>,
        chunking: &ChunkingConfig,
        embedder: &Embedder,
        cancel: &CancellationToken,
    ) -> QaResult<BuildSummary> {
        if self
            .building
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(QaError::BuildInProgress {
                knowledge_base_id: self.id.clone(),
            });
        }
        let prior = {
            let mut status = self.status.write();
            let prior = status.state;
            status.state = KbState::Building;
            prior
        };
        let mut guard = BuildGuard {
            kb: self,
            prior,
            settled: false,
        };
        tracing::info!(
            knowledge_base = %self.id,
            documents = documents.len(),
            markup = markup.is_some(),
            "knowledge base build started"
        );

        let started = Instant::now();
        match self.run_build(documents, markup, chunking, embedder, cancel).await {
            Ok(snapshot) => {
                let summary = BuildSummary {
                    documents: documents.len(),
                    doc_chunks: snapshot.count_kind(SourceKind::Doc),
                    markup_chunks: snapshot.count_kind(SourceKind::Markup),
                    degenerate_chunks: snapshot.degenerate_count(),
                    dimension: snapshot.dimension(),
                    embedding_model: embedder.model_name().to_string(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    built_at: Utc::now(),
                };
                self.index.publish(snapshot);
                guard.settled = true;
                let mut status = self.status.write();
                status.state = KbState::Ready;
                status.summary = Some(summary.clone());
                status.last_error = None;
                tracing::info!(
                    knowledge_base = %self.id,
                    doc_chunks = summary.doc_chunks,
                    markup_chunks = summary.markup_chunks,
                    duration_ms = summary.duration_ms,
                    "knowledge base ready"
                );
                Ok(summary)
            }
            Err(e @ QaError::Cancelled { .. }) => Err(e),
            Err(e) => {
                self.index.clear();
                guard.settled = true;
                let mut status = self.status.write();
                status.state = KbState::Failed;
                status.summary = None;
                status.last_error = Some(e.to_string());
                tracing::error!(knowledge_base = %self.id, error = %e, "knowledge base build failed");
                Err(e)
            }
        }
    }

    async fn run_build(
        &self,
        documents: &[SourceDocument],
        markup: Option<&MarkupPage>,
        chunking: &ChunkingConfig,
        embedder: &Embedder,
        cancel: &CancellationToken,
    ) -> QaResult<Arc<IndexSnapshot>> {
        let chunks = chunk_inputs(documents, markup, chunking)?;
        if chunks.is_empty() {
            return Err(QaError::InvalidRequest(
                "a build needs at least one document or a markup page".to_string(),
            ));
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = embedder.embed(&texts, cancel).await?;
        let embedded: Vec<EmbeddedChunk> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| EmbeddedChunk { chunk, vector })
            .collect();
        let snapshot = IndexSnapshot::build(embedded, embedder.dims())?;

        if cancel.is_cancelled() {
            return Err(QaError::Cancelled {
                stage: "build".to_string(),
            });
        }
        Ok(Arc::new(snapshot))
    }
}

/// Chunk every input in a fixed order: documents as given, then markup.
pub fn chunk_inputs(
    documents: &[SourceDocument],
    markup: Option<&MarkupPage>,
    chunking: &ChunkingConfig,
) -> QaResult<Vec<Chunk>> {
    let doc_params = chunking.doc_params();
    let mut chunks = Vec::new();
    for doc in documents {
        chunks.extend(chunk(ChunkSource::Text(&doc.text), &doc.id, &doc_params)?);
    }
    if let Some(page) = markup {
        chunks.extend(chunk(
            ChunkSource::Markup(&page.root),
            &page.id,
            &chunking.markup_params(),
        )?);
    }
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EmbeddingConfig, RetryConfig};
    use crate::embedding::HashEmbedder;

    fn embedder() -> Embedder {
        Embedder::new(
            Arc::new(HashEmbedder::new(64)),
            &EmbeddingConfig::default(),
            RetryConfig::default(),
        )
    }

    fn docs() -> Vec<SourceDocument> {
        vec![SourceDocument::new(
            "spec.md",
            "Discount codes under 10 characters are rejected with error 'Invalid code'.",
        )]
    }

    #[tokio::test]
    async fn build_publishes_ready_snapshot() {
        let kb = KnowledgeBase::new("kb1");
        assert_eq!(kb.state(), KbState::Empty);
        assert!(matches!(
            kb.query_snapshot(),
            Err(QaError::KnowledgeBaseNotReady {
                state: KbState::Empty,
                ..
            })
        ));

        let summary = kb
            .build(&docs(), None, &ChunkingConfig::default(), &embedder(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.doc_chunks, 1);
        assert_eq!(summary.dimension, 64);
        assert_eq!(kb.state(), KbState::Ready);
        assert_eq!(kb.query_snapshot().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancelled_build_keeps_prior_state() {
        let kb = KnowledgeBase::new("kb1");
        kb.build(&docs(), None, &ChunkingConfig::default(), &embedder(), &CancellationToken::new())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = kb
            .build(&docs(), None, &ChunkingConfig::default(), &embedder(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, QaError::Cancelled { .. }));
        assert_eq!(kb.state(), KbState::Ready);
        assert!(kb.query_snapshot().is_ok());
    }

    #[tokio::test]
    async fn empty_inputs_fail_the_build() {
        let kb = KnowledgeBase::new("kb1");
        let err = kb
            .build(&[], None, &ChunkingConfig::default(), &embedder(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, QaError::InvalidRequest(_)));
        assert_eq!(kb.state(), KbState::Failed);
        assert!(kb.status().last_error.is_some());
    }

    #[test]
    fn chunk_inputs_orders_documents_before_markup() {
        let page = MarkupPage {
            id: "page.html".into(),
            root: MarkupNode::element(
                "form",
                &[("id", "checkout")],
                vec![MarkupNode::element("input", &[("id", "discount-code")], vec![])],
            ),
        };
        let mut root = page.root.clone();
        qa_harness_core::markup::assign_selectors(&mut root);
        let page = MarkupPage { root, ..page };

        let chunks = chunk_inputs(&docs(), Some(&page), &ChunkingConfig::default()).unwrap();
        assert_eq!(chunks[0].source_kind, SourceKind::Doc);
        let last = chunks.last().unwrap();
        assert_eq!(last.source_kind, SourceKind::Markup);
        assert!(last.selectors().contains(&"#discount-code".to_string()));
    }
}
