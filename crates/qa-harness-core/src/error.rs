//! Error taxonomy shared by every stage of the pipeline.
//!
//! Capability failures (network embedding / generation backends) are first
//! classified as [`CapabilityError`] so the retry layer can tell transient
//! failures from permanent ones. Everything that reaches a caller is a
//! [`QaError`] carrying enough context (stage, ids, attempt counts) to
//! reproduce the failure.

use thiserror::Error;

use crate::models::KbState;

/// Failure reported by an embedding or generation backend.
#[derive(Debug, Clone, Error)]
pub enum CapabilityError {
    /// Rate limits, 5xx responses, timeouts, connection resets.
    #[error("transient capability failure: {0}")]
    Transient(String),
    /// Bad requests, missing credentials, malformed responses.
    #[error("permanent capability failure: {0}")]
    Permanent(String),
}

impl CapabilityError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CapabilityError::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            CapabilityError::Transient(m) | CapabilityError::Permanent(m) => m,
        }
    }
}

/// A single grounding violation found while validating generated output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Test case id (or script id) the violation belongs to.
    pub subject: String,
    /// Field path, e.g. `steps[1].expected_result`.
    pub field: String,
    /// What was wrong, phrased so it can be fed back to the generator.
    pub detail: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}: {}", self.subject, self.field, self.detail)
    }
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors surfaced by the QA Harness pipeline.
#[derive(Debug, Error)]
pub enum QaError {
    #[error("chunking failed for source '{source_id}': {reason}")]
    Chunking { source_id: String, reason: String },

    #[error("embedding unavailable at batch offset {batch_offset} after {attempts} attempt(s): {message}")]
    EmbeddingUnavailable {
        batch_offset: usize,
        attempts: u32,
        message: String,
    },

    #[error("embedding dimension mismatch for chunk '{chunk_id}': expected {expected}, got {actual}")]
    DimensionMismatch {
        chunk_id: String,
        expected: usize,
        actual: usize,
    },

    #[error("vector index has no published snapshot")]
    IndexNotReady,

    #[error("knowledge base '{knowledge_base_id}' is not ready (state: {state})")]
    KnowledgeBaseNotReady {
        knowledge_base_id: String,
        state: KbState,
    },

    #[error("a build is already in progress for knowledge base '{knowledge_base_id}'")]
    BuildInProgress { knowledge_base_id: String },

    #[error("generation unavailable during {stage} after {attempts} attempt(s): {message}")]
    GenerationUnavailable {
        stage: String,
        attempts: u32,
        message: String,
    },

    #[error("generated test cases are not grounded in evidence {evidence_ids:?}: {}", join_violations(.violations))]
    GenerationGroundingFailed {
        evidence_ids: Vec<String>,
        violations: Vec<Violation>,
    },

    #[error("script for test case '{test_case_id}' is not grounded (allowed selectors {allowed:?}): {}", join_violations(.violations))]
    SelectorGroundingFailed {
        test_case_id: String,
        allowed: Vec<String>,
        violations: Vec<Violation>,
    },

    #[error("no evidence retrieved for {stage}")]
    NoEvidence { stage: String },

    #[error("could not parse {stage} response: {reason}")]
    SchemaParse { stage: String, reason: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{stage} cancelled")]
    Cancelled { stage: String },
}

pub type QaResult<T> = std::result::Result<T, QaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grounding_error_lists_violations() {
        let err = QaError::GenerationGroundingFailed {
            evidence_ids: vec!["c1".into()],
            violations: vec![
                Violation {
                    subject: "TC-1".into(),
                    field: "title".into(),
                    detail: "quoted text 'Foo' not in evidence".into(),
                },
                Violation {
                    subject: "TC-2".into(),
                    field: "evidence_chunk_ids".into(),
                    detail: "empty".into(),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("TC-1 title"));
        assert!(msg.contains("TC-2 evidence_chunk_ids: empty"));
    }

    #[test]
    fn capability_error_classification() {
        assert!(CapabilityError::Transient("429".into()).is_transient());
        assert!(!CapabilityError::Permanent("401".into()).is_transient());
        assert_eq!(CapabilityError::Permanent("bad".into()).message(), "bad");
    }
}
