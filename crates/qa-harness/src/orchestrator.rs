//! Retrieval-grounded test case generation.
//!
//! A query is embedded, matched against the knowledge base's published
//! snapshot, and turned into a constrained generation request that carries
//! only the retrieved evidence. The response is parsed strictly and every
//! test case is checked against the evidence it cites; one corrective retry
//! is allowed before the request fails. Nothing is ever fabricated to fill a
//! gap.

use qa_harness_core::correction::{generate_with_correction, CorrectionOutcome, Rejection, Verdict};
use qa_harness_core::generation::GenerationRequest;
use qa_harness_core::grounding::{references_ui, validate_test_cases, GroundingPolicy};
use qa_harness_core::index::SearchFilter;
use qa_harness_core::models::{RetrievalResult, SourceKind, TestCase};
use qa_harness_core::parse::{parse_test_cases, ParseOutcome};
use qa_harness_core::prompt::{test_case_request, TEST_CASE_STAGE};
use qa_harness_core::{QaError, QaResult};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::{RetrievalConfig, MAX_TEST_CASES_LIMIT};
use crate::embedding::Embedder;
use crate::generation::Generator;
use crate::knowledge_base::KnowledgeBase;

const MIN_QUERY_CHARS: usize = 3;
const MAX_QUERY_CHARS: usize = 512;

/// A test case generation request.
#[derive(Debug, Clone, Deserialize)]
pub struct TestCaseRequest {
    pub query: String,
    #[serde(default)]
    pub max_test_cases: Option<usize>,
    /// Retrieval depth; defaults to `min(max_test_cases × 3, 20)`.
    #[serde(default)]
    pub k: Option<usize>,
}

impl TestCaseRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            max_test_cases: None,
            k: None,
        }
    }
}

/// Accepted test cases and the evidence they were validated against.
#[derive(Debug, Clone, Serialize)]
pub struct GeneratedTestCases {
    pub test_cases: Vec<TestCase>,
    pub evidence: RetrievalResult,
    /// Generation calls made, including the corrective retry.
    pub attempts: u32,
}

pub struct Orchestrator {
    embedder: Embedder,
    generator: Generator,
    retrieval: RetrievalConfig,
    grounding: GroundingPolicy,
    max_corrections: u32,
}

impl Orchestrator {
    pub fn new(
        embedder: Embedder,
        generator: Generator,
        retrieval: RetrievalConfig,
        grounding: GroundingPolicy,
        max_corrections: u32,
    ) -> Self {
        Self {
            embedder,
            generator,
            retrieval,
            grounding,
            max_corrections,
        }
    }

    /// Generate evidence-grounded test cases for `request.query`.
    pub async fn generate_test_cases(
        &self,
        kb: &KnowledgeBase,
        request: &TestCaseRequest,
        cancel: &CancellationToken,
    ) -> QaResult<GeneratedTestCases> {
        let query = request.query.trim();
        let (max_test_cases, k) = self.limits(query, request)?;
        let snapshot = kb.query_snapshot()?;

        let query_vector = self.embedder.embed_query(query, cancel).await?;
        let filter = if references_ui(query) {
            SearchFilter::any()
        } else {
            SearchFilter::kind(SourceKind::Doc)
        };
        let evidence = snapshot.search(&query_vector, k, filter)?;
        if evidence.is_empty() {
            return Err(QaError::NoEvidence {
                stage: TEST_CASE_STAGE.to_string(),
            });
        }
        tracing::debug!(
            knowledge_base = kb.id(),
            k,
            retrieved = evidence.len(),
            "retrieved evidence for test case generation"
        );

        let generation_request = test_case_request(query, &evidence, max_test_cases);
        let outcome = self
            .generate_grounded(&generation_request, &evidence, cancel)
            .await?;
        if cancel.is_cancelled() {
            return Err(QaError::Cancelled {
                stage: TEST_CASE_STAGE.to_string(),
            });
        }

        match outcome {
            CorrectionOutcome::Accepted {
                value: mut test_cases,
                attempts,
            } => {
                test_cases.truncate(max_test_cases);
                tracing::info!(
                    knowledge_base = kb.id(),
                    test_cases = test_cases.len(),
                    attempts,
                    "test cases generated"
                );
                Ok(GeneratedTestCases {
                    test_cases,
                    evidence,
                    attempts,
                })
            }
            CorrectionOutcome::Rejected {
                rejection: Rejection::ParseFailed(reason),
                ..
            } => Err(QaError::SchemaParse {
                stage: TEST_CASE_STAGE.to_string(),
                reason,
            }),
            CorrectionOutcome::Rejected {
                rejection: Rejection::Ungrounded(violations),
                ..
            } => Err(QaError::GenerationGroundingFailed {
                evidence_ids: evidence.ids().into_iter().collect(),
                violations,
            }),
        }
    }

    fn limits(&self, query: &str, request: &TestCaseRequest) -> QaResult<(usize, usize)> {
        let chars = query.chars().count();
        if !(MIN_QUERY_CHARS..=MAX_QUERY_CHARS).contains(&chars) {
            return Err(QaError::InvalidRequest(format!(
                "query must be {}-{} characters, got {}",
                MIN_QUERY_CHARS, MAX_QUERY_CHARS, chars
            )));
        }
        let max_test_cases = request
            .max_test_cases
            .unwrap_or(self.retrieval.default_max_test_cases);
        if !(1..=MAX_TEST_CASES_LIMIT).contains(&max_test_cases) {
            return Err(QaError::InvalidRequest(format!(
                "max_test_cases must be between 1 and {}, got {}",
                MAX_TEST_CASES_LIMIT, max_test_cases
            )));
        }
        let k = match request.k {
            Some(0) => return Err(QaError::InvalidRequest("k must be at least 1".to_string())),
            Some(k) => k,
            None => self.retrieval.default_k(max_test_cases),
        };
        Ok((max_test_cases, k))
    }

    async fn generate_grounded(
        &self,
        request: &GenerationRequest,
        evidence: &RetrievalResult,
        cancel: &CancellationToken,
    ) -> QaResult<CorrectionOutcome<Vec<TestCase>>> {
        let generator = &self.generator;
        let policy = &self.grounding;
        generate_with_correction(
            request,
            self.max_corrections,
            move |req: GenerationRequest| async move { generator.generate(&req, cancel).await },
            |raw: &str| match parse_test_cases(raw) {
                ParseOutcome::ParsedOk(cases) => {
                    let violations = validate_test_cases(&cases, evidence, policy);
                    if violations.is_empty() {
                        Verdict::Accept(cases)
                    } else {
                        Verdict::Ungrounded(violations)
                    }
                }
                ParseOutcome::ParseFailed(reason) => Verdict::ParseFailed(reason),
            },
        )
        .await
    }
}
