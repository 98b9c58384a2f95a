//! Prompt construction for the two generation stages.
//!
//! Requests only ever carry the retrieved evidence: each chunk is labelled
//! with its id so the generator can cite it, and the system instruction
//! forbids anything not present in that evidence. Test-case requests attach
//! the JSON schema the response must satisfy; script requests list the
//! allowed selectors verbatim.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use serde_json::json;

use crate::error::Violation;
use crate::generation::{GenerationRequest, ResponseFormat};
use crate::models::{RetrievalResult, TestCase};

pub const TEST_CASE_STAGE: &str = "test_case_generation";
pub const SCRIPT_STAGE: &str = "script_synthesis";

const TEST_CASE_SYSTEM: &str = "You are an expert QA engineer. You write test cases strictly from \
the evidence you are given. Never invent features, fields, values, messages, or selectors that \
do not appear in the evidence. Every test case must cite, in evidence_chunk_ids, the ids of the \
evidence chunks that support it. Respond only with JSON matching the supplied schema.";

const SCRIPT_SYSTEM: &str = "You are a QA automation engineer. You write runnable Python Selenium \
WebDriver scripts. Locate elements only with the selectors you are given, exactly as written. \
Respond only with Python code, no explanations.";

/// JSON schema for a test-case generation response.
pub fn test_case_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["test_cases"],
        "properties": {
            "test_cases": {
                "type": "array",
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": ["id", "title", "preconditions", "steps", "category", "evidence_chunk_ids"],
                    "properties": {
                        "id": { "type": "string" },
                        "title": { "type": "string" },
                        "preconditions": { "type": "array", "items": { "type": "string" } },
                        "steps": {
                            "type": "array",
                            "minItems": 1,
                            "items": {
                                "type": "object",
                                "additionalProperties": false,
                                "required": ["action", "target_hint", "expected_result"],
                                "properties": {
                                    "action": { "type": "string" },
                                    "target_hint": { "type": "string" },
                                    "expected_result": { "type": "string" }
                                }
                            }
                        },
                        "category": { "type": "string", "enum": ["positive", "negative", "edge"] },
                        "evidence_chunk_ids": {
                            "type": "array",
                            "minItems": 1,
                            "items": { "type": "string" }
                        }
                    }
                }
            }
        }
    })
}

/// Render evidence chunks as labelled blocks.
pub fn render_evidence(evidence: &RetrievalResult) -> String {
    let mut out = String::new();
    for chunk in evidence.chunks() {
        let _ = writeln!(
            out,
            "[{}] ({}: {})",
            chunk.id, chunk.source_kind, chunk.source_document_id
        );
        out.push_str(chunk.text.trim_end());
        out.push_str("\n\n");
    }
    out
}

/// Request for up to `max_test_cases` test cases about `query`.
pub fn test_case_request(query: &str, evidence: &RetrievalResult, max_test_cases: usize) -> GenerationRequest {
    let prompt = format!(
        "EVIDENCE:\n\"\"\"\n{evidence}\"\"\"\n\n\
         TASK:\nGenerate at most {max_test_cases} test case(s) focusing on: \"{query}\".\n\
         Use category \"positive\", \"negative\", or \"edge\".\n\
         Quote UI labels, messages, and values exactly as they appear in the evidence.\n\
         evidence_chunk_ids may only contain these ids: {ids}.",
        evidence = render_evidence(evidence),
        ids = evidence
            .chunks()
            .map(|c| c.id.as_str())
            .collect::<Vec<_>>()
            .join(", "),
    );
    GenerationRequest {
        stage: TEST_CASE_STAGE.to_string(),
        system: TEST_CASE_SYSTEM.to_string(),
        prompt,
        format: ResponseFormat::Json {
            schema: test_case_schema(),
        },
    }
}

/// Request for a Selenium script implementing `test_case`.
pub fn script_request(
    test_case: &TestCase,
    evidence: &RetrievalResult,
    allowed: &BTreeSet<String>,
) -> GenerationRequest {
    let mut steps = String::new();
    for (i, step) in test_case.steps.iter().enumerate() {
        let _ = writeln!(
            steps,
            "{}. action: {} | target: {} | expected: {}",
            i + 1,
            step.action,
            step.target_hint,
            step.expected_result
        );
    }
    let preconditions = if test_case.preconditions.is_empty() {
        "none".to_string()
    } else {
        test_case.preconditions.join("; ")
    };
    let selectors = allowed
        .iter()
        .map(|s| format!("- {}", s))
        .collect::<Vec<_>>()
        .join("\n");

    let prompt = format!(
        "TEST CASE {id}: {title}\nPreconditions: {preconditions}\nSteps:\n{steps}\n\
         PAGE MARKUP:\n\"\"\"\n{markup}\"\"\"\n\n\
         ALLOWED SELECTORS (use By.CSS_SELECTOR with these exact strings, no others):\n{selectors}\n\n\
         Write the script as: imports and driver setup, one block per step in order, \
         then assert statements checking each expected result, then driver.quit().",
        id = test_case.id,
        title = test_case.title,
        markup = render_evidence(evidence),
    );
    GenerationRequest {
        stage: SCRIPT_STAGE.to_string(),
        system: SCRIPT_SYSTEM.to_string(),
        prompt,
        format: ResponseFormat::Code {
            language: "python".to_string(),
        },
    }
}

/// Corrective instruction listing grounding violations.
pub fn violations_correction(violations: &[Violation]) -> String {
    let mut out = String::from(
        "Your previous answer was rejected because it is not supported by the evidence:\n",
    );
    for v in violations {
        let _ = writeln!(out, "- {}", v);
    }
    out.push_str("Answer again using only facts, values, and selectors present in the evidence.");
    out
}

/// Corrective instruction for an unparseable response.
pub fn parse_correction(reason: &str, expects_json: bool) -> String {
    let shape = if expects_json {
        "a single JSON object matching the schema, with no other text"
    } else {
        "only Python code, with no explanations"
    };
    format!(
        "Your previous answer could not be parsed ({}). Respond with {}.",
        reason, shape
    )
}
