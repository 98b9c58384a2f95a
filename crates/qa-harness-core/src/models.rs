//! Core data models used throughout QA Harness.
//!
//! These types represent the chunks, retrieval sets, and generated artifacts
//! that flow through the build and query pipeline. Generated artifacts
//! ([`TestCase`], [`AutomationScript`]) serialize to the JSON shapes the HTTP
//! API returns.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Which kind of source a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Extracted document text (markdown, plain text, JSON, PDF, DOCX).
    Doc,
    /// The rendered structural traversal of the target page.
    Markup,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Doc => write!(f, "doc"),
            SourceKind::Markup => write!(f, "markup"),
        }
    }
}

/// Half-open `[start, end)` range of character offsets into a source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharSpan {
    pub start: usize,
    pub end: usize,
}

impl CharSpan {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// A bounded span of source text or markup with provenance metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Deterministic id derived from source, position, and text.
    pub id: String,
    pub text: String,
    pub source_document_id: String,
    pub source_kind: SourceKind,
    pub sequence_index: usize,
    pub char_span: CharSpan,
    /// Selectors of interactive elements wholly inside this chunk (markup only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_selectors: Option<Vec<String>>,
    /// SHA-256 of `text`.
    pub hash: String,
}

impl Chunk {
    /// Selectors recorded for this chunk, empty for document chunks.
    pub fn selectors(&self) -> &[String] {
        self.element_selectors.as_deref().unwrap_or(&[])
    }
}

/// A chunk together with its embedding vector.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedChunk {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

/// One entry of a [`RetrievalResult`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    /// Cosine similarity in `[-1.0, 1.0]`.
    pub score: f32,
}

/// Ordered evidence returned by a similarity search.
///
/// Descending by score; ties broken by ascending `sequence_index`, then
/// ascending `source_document_id`, then ascending chunk id.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetrievalResult {
    pub items: Vec<ScoredChunk>,
}

impl RetrievalResult {
    pub fn new(items: Vec<ScoredChunk>) -> Self {
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.items.iter().map(|s| &s.chunk)
    }

    pub fn ids(&self) -> BTreeSet<String> {
        self.chunks().map(|c| c.id.clone()).collect()
    }

    pub fn get(&self, id: &str) -> Option<&Chunk> {
        self.chunks().find(|c| c.id == id)
    }

    /// Union of the selectors of every markup chunk in the result.
    pub fn selectors(&self) -> BTreeSet<String> {
        self.chunks()
            .filter(|c| c.source_kind == SourceKind::Markup)
            .flat_map(|c| c.selectors().iter().cloned())
            .collect()
    }

    /// Keep only chunks of one kind, preserving order.
    pub fn restricted_to(&self, kind: SourceKind) -> RetrievalResult {
        RetrievalResult {
            items: self
                .items
                .iter()
                .filter(|s| s.chunk.source_kind == kind)
                .cloned()
                .collect(),
        }
    }
}

/// Test case category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Positive,
    Negative,
    Edge,
}

/// One ordered step of a [`TestCase`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestStep {
    pub action: String,
    pub target_hint: String,
    pub expected_result: String,
}

/// A structured, evidence-linked test case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestCase {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub preconditions: Vec<String>,
    pub steps: Vec<TestStep>,
    pub category: Category,
    pub evidence_chunk_ids: BTreeSet<String>,
}

impl TestCase {
    /// Natural-language rendering used as a retrieval query for markup evidence.
    pub fn query_text(&self) -> String {
        let mut parts = vec![self.title.clone()];
        parts.extend(self.preconditions.iter().cloned());
        for step in &self.steps {
            parts.push(format!(
                "{} {} {}",
                step.action, step.target_hint, step.expected_result
            ));
        }
        parts.join("\n")
    }
}

/// A generated browser-automation script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutomationScript {
    pub test_case_id: String,
    pub source_text: String,
    pub referenced_selectors: BTreeSet<String>,
}

/// Lifecycle state of a knowledge base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KbState {
    Empty,
    Building,
    Ready,
    Failed,
}

impl fmt::Display for KbState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KbState::Empty => "empty",
            KbState::Building => "building",
            KbState::Ready => "ready",
            KbState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Extracted plain text of one uploaded document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDocument {
    pub id: String,
    pub text: String,
}

impl SourceDocument {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
        }
    }
}
