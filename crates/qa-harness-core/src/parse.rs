//! Strict parsing of generated responses.
//!
//! Generated text is never trusted: it is parsed into typed structs with
//! unknown fields rejected, and the result is reported as a [`ParseOutcome`]
//! so the correction loop can decide whether to retry.

use std::collections::HashSet;

use serde::Deserialize;

use crate::models::TestCase;

/// Result of parsing one generated response.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome<T> {
    ParsedOk(T),
    ParseFailed(String),
}

impl<T> ParseOutcome<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, ParseOutcome::ParsedOk(_))
    }

    pub fn ok(self) -> Option<T> {
        match self {
            ParseOutcome::ParsedOk(v) => Some(v),
            ParseOutcome::ParseFailed(_) => None,
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct TestCaseEnvelope {
    test_cases: Vec<TestCase>,
}

/// Remove a surrounding markdown code fence, if any.
///
/// Handles ```` ```json ````, ```` ```python ```` and bare fences, including
/// a fence preceded by prose.
pub fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(open) = trimmed.find("```") else {
        return trimmed;
    };
    let after_open = &trimmed[open + 3..];
    let body_start = match after_open.find('\n') {
        Some(nl) => nl + 1,
        None => return after_open.trim_end_matches('`').trim(),
    };
    let body = &after_open[body_start..];
    match body.rfind("```") {
        Some(close) => body[..close].trim(),
        None => body.trim(),
    }
}

/// Parse a test-case response: a bare array or `{"test_cases": [...]}`.
pub fn parse_test_cases(raw: &str) -> ParseOutcome<Vec<TestCase>> {
    let text = strip_code_fence(raw);
    if text.is_empty() {
        return ParseOutcome::ParseFailed("empty response".to_string());
    }

    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => return ParseOutcome::ParseFailed(format!("invalid JSON: {}", e)),
    };

    let parsed = match value {
        serde_json::Value::Array(_) => serde_json::from_value::<Vec<TestCase>>(value),
        serde_json::Value::Object(ref map) if map.contains_key("test_cases") => {
            serde_json::from_value::<TestCaseEnvelope>(value).map(|e| e.test_cases)
        }
        _ => {
            return ParseOutcome::ParseFailed(
                "expected a JSON array of test cases or an object with a 'test_cases' array"
                    .to_string(),
            )
        }
    };

    let cases = match parsed {
        Ok(cases) => cases,
        Err(e) => return ParseOutcome::ParseFailed(format!("schema mismatch: {}", e)),
    };

    if let Err(reason) = check_shape(&cases) {
        return ParseOutcome::ParseFailed(reason);
    }
    ParseOutcome::ParsedOk(cases)
}

fn check_shape(cases: &[TestCase]) -> Result<(), String> {
    if cases.is_empty() {
        return Err("response contained no test cases".to_string());
    }
    let mut seen = HashSet::new();
    for (i, tc) in cases.iter().enumerate() {
        if tc.id.trim().is_empty() {
            return Err(format!("test_cases[{}].id is empty", i));
        }
        if !seen.insert(tc.id.as_str()) {
            return Err(format!("duplicate test case id '{}'", tc.id));
        }
        if tc.title.trim().is_empty() {
            return Err(format!("test case '{}' has an empty title", tc.id));
        }
        if tc.steps.is_empty() {
            return Err(format!("test case '{}' has no steps", tc.id));
        }
    }
    Ok(())
}

/// Extract Python source from a script response.
pub fn extract_script_source(raw: &str) -> ParseOutcome<String> {
    let text = strip_code_fence(raw);
    if text.is_empty() {
        return ParseOutcome::ParseFailed("empty response".to_string());
    }
    if text.starts_with('{') || text.starts_with('[') {
        return ParseOutcome::ParseFailed("response looks like JSON, not Python code".to_string());
    }
    ParseOutcome::ParsedOk(format!("{}\n", text))
}
