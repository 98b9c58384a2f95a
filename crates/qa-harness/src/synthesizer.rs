//! Selenium script synthesis with selector grounding.
//!
//! The test case's own text is the retrieval query, restricted to markup
//! chunks. The selectors recorded on those chunks form the allowed set: the
//! generated script may locate elements only through them.

use std::collections::BTreeSet;

use qa_harness_core::correction::{generate_with_correction, CorrectionOutcome, Rejection, Verdict};
use qa_harness_core::generation::GenerationRequest;
use qa_harness_core::index::SearchFilter;
use qa_harness_core::models::{AutomationScript, RetrievalResult, SourceKind, TestCase};
use qa_harness_core::parse::{extract_script_source, ParseOutcome};
use qa_harness_core::prompt::{script_request, SCRIPT_STAGE};
use qa_harness_core::selectors::check_script;
use qa_harness_core::{QaError, QaResult, Violation};
use tokio_util::sync::CancellationToken;

use crate::embedding::Embedder;
use crate::generation::Generator;
use crate::knowledge_base::KnowledgeBase;

pub struct ScriptSynthesizer {
    embedder: Embedder,
    generator: Generator,
    script_k: usize,
    max_corrections: u32,
}

impl ScriptSynthesizer {
    pub fn new(embedder: Embedder, generator: Generator, script_k: usize, max_corrections: u32) -> Self {
        Self {
            embedder,
            generator,
            script_k: script_k.max(1),
            max_corrections,
        }
    }

    /// Retrieve markup evidence for `test_case` and synthesize its script.
    pub async fn generate_script(
        &self,
        kb: &KnowledgeBase,
        test_case: &TestCase,
        cancel: &CancellationToken,
    ) -> QaResult<AutomationScript> {
        let snapshot = kb.query_snapshot()?;
        let query_vector = self
            .embedder
            .embed_query(&test_case.query_text(), cancel)
            .await?;
        let evidence = snapshot.search(&query_vector, self.script_k, SearchFilter::kind(SourceKind::Markup))?;
        self.synthesize(test_case, &evidence, cancel).await
    }

    /// Synthesize a script for `test_case` from already retrieved markup
    /// evidence.
    ///
    /// # Errors
    ///
    /// [`QaError::SelectorGroundingFailed`] when the evidence carries no
    /// selectors or the script still references anything else after the
    /// corrective retry; [`QaError::SchemaParse`] when no script text could be
    /// extracted.
    pub async fn synthesize(
        &self,
        test_case: &TestCase,
        markup_evidence: &RetrievalResult,
        cancel: &CancellationToken,
    ) -> QaResult<AutomationScript> {
        let allowed = markup_evidence.selectors();
        if allowed.is_empty() {
            return Err(QaError::SelectorGroundingFailed {
                test_case_id: test_case.id.clone(),
                allowed: Vec::new(),
                violations: vec![Violation {
                    subject: test_case.id.clone(),
                    field: "markup_evidence".to_string(),
                    detail: "no interactive elements were retrieved for this test case".to_string(),
                }],
            });
        }

        let request = script_request(test_case, markup_evidence, &allowed);
        let outcome = self
            .generate_checked(&request, &test_case.id, &allowed, cancel)
            .await?;
        if cancel.is_cancelled() {
            return Err(QaError::Cancelled {
                stage: SCRIPT_STAGE.to_string(),
            });
        }

        match outcome {
            CorrectionOutcome::Accepted {
                value: (source_text, referenced_selectors),
                attempts,
            } => {
                tracing::info!(
                    test_case = %test_case.id,
                    selectors = referenced_selectors.len(),
                    attempts,
                    "automation script generated"
                );
                Ok(AutomationScript {
                    test_case_id: test_case.id.clone(),
                    source_text,
                    referenced_selectors,
                })
            }
            CorrectionOutcome::Rejected {
                rejection: Rejection::ParseFailed(reason),
                ..
            } => Err(QaError::SchemaParse {
                stage: SCRIPT_STAGE.to_string(),
                reason,
            }),
            CorrectionOutcome::Rejected {
                rejection: Rejection::Ungrounded(violations),
                ..
            } => Err(QaError::SelectorGroundingFailed {
                test_case_id: test_case.id.clone(),
                allowed: allowed.into_iter().collect(),
                violations,
            }),
        }
    }

    async fn generate_checked(
        &self,
        request: &GenerationRequest,
        test_case_id: &str,
        allowed: &BTreeSet<String>,
        cancel: &CancellationToken,
    ) -> QaResult<CorrectionOutcome<(String, BTreeSet<String>)>> {
        let generator = &self.generator;
        generate_with_correction(
            request,
            self.max_corrections,
            move |req: GenerationRequest| async move { generator.generate(&req, cancel).await },
            |raw: &str| match extract_script_source(raw) {
                ParseOutcome::ParsedOk(source) => {
                    let check = check_script(test_case_id, &source, allowed);
                    if check.is_ok() {
                        Verdict::Accept((source, check.referenced))
                    } else {
                        Verdict::Ungrounded(check.violations)
                    }
                }
                ParseOutcome::ParseFailed(reason) => Verdict::ParseFailed(reason),
            },
        )
        .await
    }
}
