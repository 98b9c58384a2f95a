//! Evidence grounding checks for generated test cases.
//!
//! A test case is grounded when everything it claims can be traced to the
//! chunks it cites. The rule, applied field by field against the union of the
//! cited chunks' texts:
//!
//! - `evidence_chunk_ids` is non-empty and every id was actually retrieved;
//! - quoted literals (`'…'`, `"…"`, `“…”`) occur in the evidence, ignoring case;
//! - numbers occur in the evidence;
//! - a selector-shaped `target_hint` normalizes to a selector of a cited
//!   markup chunk;
//! - at least [`GroundingPolicy::min_token_overlap`] of the field's content
//!   words occur in the evidence vocabulary.
//!
//! Content words are lower-cased alphanumeric runs of at least
//! [`GroundingPolicy::min_token_len`] characters, excluding stop words and
//! generic test-writing vocabulary ("click", "verify", "displayed", …) that
//! any test case may use regardless of the evidence.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::Violation;
use crate::markup::normalize_selector;
use crate::models::{Chunk, RetrievalResult, SourceKind, TestCase};

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "from", "into", "then", "when", "are", "was",
    "were", "has", "have", "had", "its", "not", "but", "can", "will", "all", "any", "each",
    "been", "being", "there", "their", "they", "them", "than", "which", "who", "what", "where",
    "while", "also", "only", "such", "after", "before", "does", "did", "should", "would", "could",
    "must", "may", "might", "shall", "you", "your", "our", "his", "her", "both", "either",
    "neither", "via", "per", "upon", "without", "within", "using", "given", "more", "less",
];

const GENERIC_TEST_WORDS: &[&str] = &[
    "click", "clicks", "clicked", "enter", "enters", "entered", "type", "types", "typed",
    "verify", "verifies", "verified", "check", "checks", "ensure", "ensures", "confirm",
    "user", "users", "page", "field", "fields", "button", "buttons", "displayed", "display",
    "displays", "shown", "show", "shows", "visible", "appears", "appear", "navigate", "navigates",
    "open", "opens", "select", "selects", "selected", "input", "inputs", "value", "values",
    "valid", "invalid", "correct", "correctly", "successfully", "success", "message", "test",
    "step", "steps", "expected", "result", "results", "action", "attempt", "attempts", "tries",
    "try", "leave", "leaves", "empty", "blank", "submit", "submits", "submitted", "form", "load",
    "loads", "loaded", "again", "remains", "remain", "still", "text", "element", "present",
    "updated", "update", "updates", "applied", "apply", "applies",
];

const UI_KEYWORDS: &[&str] = &[
    "ui", "button", "buttons", "click", "clicks", "field", "fields", "form", "forms", "input",
    "inputs", "page", "screen", "element", "elements", "selector", "selectors", "link", "links",
    "dropdown", "checkbox", "radio", "label", "labels", "textbox", "modal", "layout", "html",
    "css", "visible", "displayed", "submit", "error", "errors", "validation", "enter", "type",
    "select", "tab", "menu", "popup", "banner", "toast",
];

/// Tunable parameters of the grounding rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroundingPolicy {
    /// Minimum fraction of a field's content words found in the evidence.
    pub min_token_overlap: f32,
    /// Shorter words are not treated as content words.
    pub min_token_len: usize,
    pub check_quoted_literals: bool,
    pub check_numbers: bool,
}

impl Default for GroundingPolicy {
    fn default() -> Self {
        Self {
            min_token_overlap: 0.5,
            min_token_len: 3,
            check_quoted_literals: true,
            check_numbers: true,
        }
    }
}

/// Whether a natural-language query is about UI behaviour.
pub fn references_ui(query: &str) -> bool {
    words(query).any(|w| UI_KEYWORDS.contains(&w.as_str()))
}

/// Validate every test case against the retrieved evidence.
///
/// Returns all violations found; an empty vector means the set is grounded.
pub fn validate_test_cases(
    cases: &[TestCase],
    evidence: &RetrievalResult,
    policy: &GroundingPolicy,
) -> Vec<Violation> {
    let mut violations = Vec::new();
    for tc in cases {
        validate_one(tc, evidence, policy, &mut violations);
    }
    violations
}

struct CitedEvidence {
    text_lower: String,
    vocabulary: HashSet<String>,
    numbers: HashSet<String>,
    selectors: BTreeSet<String>,
}

impl CitedEvidence {
    fn from_chunks<'a>(chunks: impl Iterator<Item = &'a Chunk>) -> Self {
        let mut text_lower = String::new();
        let mut selectors = BTreeSet::new();
        for chunk in chunks {
            text_lower.push_str(&chunk.text.to_lowercase());
            text_lower.push('\n');
            if chunk.source_kind == SourceKind::Markup {
                selectors.extend(chunk.selectors().iter().map(|s| normalize_selector(s)));
            }
        }
        let vocabulary = words(&text_lower).map(|w| stem(&w)).collect();
        let numbers = numbers(&text_lower).into_iter().collect();
        Self {
            text_lower,
            vocabulary,
            numbers,
            selectors,
        }
    }
}

fn validate_one(tc: &TestCase, evidence: &RetrievalResult, policy: &GroundingPolicy, out: &mut Vec<Violation>) {
    let violation = |field: &str, detail: String| Violation {
        subject: tc.id.clone(),
        field: field.to_string(),
        detail,
    };

    if tc.evidence_chunk_ids.is_empty() {
        out.push(violation(
            "evidence_chunk_ids",
            "is empty; every test case must cite at least one evidence chunk".to_string(),
        ));
        return;
    }
    let unknown: Vec<&str> = tc
        .evidence_chunk_ids
        .iter()
        .filter(|id| evidence.get(id).is_none())
        .map(String::as_str)
        .collect();
    if !unknown.is_empty() {
        out.push(violation(
            "evidence_chunk_ids",
            format!("cites chunks that were not retrieved: {}", unknown.join(", ")),
        ));
    }
    let cited = CitedEvidence::from_chunks(
        tc.evidence_chunk_ids
            .iter()
            .filter_map(|id| evidence.get(id)),
    );
    if cited.text_lower.is_empty() {
        return;
    }

    check_text("title", &tc.title, &cited, policy, &violation, out);
    for (i, p) in tc.preconditions.iter().enumerate() {
        check_text(&format!("preconditions[{}]", i), p, &cited, policy, &violation, out);
    }
    for (i, step) in tc.steps.iter().enumerate() {
        check_text(&format!("steps[{}].action", i), &step.action, &cited, policy, &violation, out);
        let hint_field = format!("steps[{}].target_hint", i);
        if looks_like_selector(&step.target_hint) {
            let normalized = normalize_selector(&step.target_hint);
            if !cited.selectors.contains(&normalized) {
                out.push(violation(
                    hint_field.as_str(),
                    format!(
                        "selector '{}' does not belong to any cited markup chunk",
                        step.target_hint
                    ),
                ));
            }
        } else {
            check_text(&hint_field, &step.target_hint, &cited, policy, &violation, out);
        }
        check_text(
            &format!("steps[{}].expected_result", i),
            &step.expected_result,
            &cited,
            policy,
            &violation,
            out,
        );
    }
}

fn check_text(
    field: &str,
    value: &str,
    cited: &CitedEvidence,
    policy: &GroundingPolicy,
    violation: &dyn Fn(&str, String) -> Violation,
    out: &mut Vec<Violation>,
) {
    if policy.check_quoted_literals {
        for literal in quoted_literals(value) {
            if !cited.text_lower.contains(&literal.to_lowercase()) {
                out.push(violation(
                    field,
                    format!("quoted text '{}' does not appear in the cited evidence", literal),
                ));
            }
        }
    }
    if policy.check_numbers {
        for n in numbers(value) {
            if !cited.numbers.contains(&n) {
                out.push(violation(
                    field,
                    format!("number '{}' does not appear in the cited evidence", n),
                ));
            }
        }
    }

    let tokens = content_tokens(value, policy.min_token_len);
    if tokens.is_empty() {
        return;
    }
    let missing: Vec<&String> = tokens
        .iter()
        .filter(|t| !cited.vocabulary.contains(&stem(t)))
        .collect();
    let found = tokens.len() - missing.len();
    let overlap = found as f32 / tokens.len() as f32;
    if overlap < policy.min_token_overlap {
        out.push(violation(
            field,
            format!(
                "only {} of {} content words appear in the cited evidence (missing: {})",
                found,
                tokens.len(),
                missing
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        ));
    }
}

/// Lower-cased alphanumeric runs.
fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
}

/// Distinct content words of `text`, in first-occurrence order.
pub fn content_tokens(text: &str, min_len: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    words(text)
        .filter(|w| w.chars().count() >= min_len)
        .filter(|w| !w.chars().all(|c| c.is_ascii_digit()))
        .filter(|w| !STOP_WORDS.contains(&w.as_str()) && !GENERIC_TEST_WORDS.contains(&w.as_str()))
        .filter(|w| seen.insert(w.clone()))
        .collect()
}

/// Crude plural folding so "codes" matches "code".
fn stem(word: &str) -> String {
    if word.len() > 3 && word.ends_with('s') && !word.ends_with("ss") {
        word[..word.len() - 1].to_string()
    } else {
        word.to_string()
    }
}

/// Literals enclosed in straight or curly quotes.
///
/// A single quote only opens a literal at a word boundary, so apostrophes in
/// "user's" are not mistaken for quotes.
pub fn quoted_literals(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let close = match chars[i] {
            '"' => Some('"'),
            '“' => Some('”'),
            '\'' if i == 0 || !chars[i - 1].is_alphanumeric() => Some('\''),
            _ => None,
        };
        let Some(close) = close else {
            i += 1;
            continue;
        };
        let end = (i + 1..chars.len()).find(|&j| {
            chars[j] == close && (close != '\'' || j + 1 == chars.len() || !chars[j + 1].is_alphanumeric())
        });
        match end {
            Some(j) => {
                let literal: String = chars[i + 1..j].iter().collect();
                let literal = literal.trim().to_string();
                if !literal.is_empty() {
                    out.push(literal);
                }
                i = j + 1;
            }
            None => i += 1,
        }
    }
    out
}

/// Numbers in `text`, with thousands separators removed.
pub fn numbers(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        if !chars[i].is_ascii_digit() {
            i += 1;
            continue;
        }
        let mut n = String::new();
        while i < chars.len() {
            let c = chars[i];
            let joins = matches!(c, '.' | ',')
                && i + 1 < chars.len()
                && chars[i + 1].is_ascii_digit()
                && !n.is_empty();
            if c.is_ascii_digit() {
                n.push(c);
            } else if joins {
                if c == '.' {
                    n.push('.');
                }
            } else {
                break;
            }
            i += 1;
        }
        out.push(n);
    }
    out
}

/// Whether a target hint is written as a CSS or XPath selector.
pub fn looks_like_selector(hint: &str) -> bool {
    let h = hint.trim();
    if h.is_empty() || h.contains(char::is_whitespace) && !h.contains('>') && !h.starts_with("//") {
        return false;
    }
    h.starts_with('#')
        || h.starts_with('.')
        || h.starts_with('[')
        || h.starts_with("//")
        || h.contains("[name=")
        || h.contains("[id=")
        || h.split_once('#').map_or(false, |(tag, _)| {
            !tag.is_empty() && tag.chars().all(|c| c.is_ascii_alphanumeric())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Category, CharSpan, ScoredChunk, TestStep};

    fn doc_chunk(id: &str, text: &str) -> Chunk {
        Chunk {
            id: id.into(),
            text: text.into(),
            source_document_id: "product_specs.md".into(),
            source_kind: SourceKind::Doc,
            sequence_index: 0,
            char_span: CharSpan { start: 0, end: text.chars().count() },
            element_selectors: None,
            hash: String::new(),
        }
    }

    fn markup_chunk(id: &str, text: &str, selectors: &[&str]) -> Chunk {
        Chunk {
            source_kind: SourceKind::Markup,
            source_document_id: "checkout.html".into(),
            element_selectors: Some(selectors.iter().map(|s| s.to_string()).collect()),
            ..doc_chunk(id, text)
        }
    }

    fn evidence() -> RetrievalResult {
        RetrievalResult::new(vec![
            ScoredChunk {
                chunk: doc_chunk(
                    "chk-doc",
                    "The discount code SAVE15 applies a 15% discount to the order total.",
                ),
                score: 0.9,
            },
            ScoredChunk {
                chunk: markup_chunk(
                    "chk-ui",
                    "<input id=\"discount-code\" name=\"discount\"></input>\n<button id=\"apply-discount\">Apply</button>\n",
                    &["#discount-code", "#apply-discount"],
                ),
                score: 0.8,
            },
        ])
    }

    fn case(steps: Vec<TestStep>, ids: &[&str]) -> TestCase {
        TestCase {
            id: "TC-1".into(),
            title: "Apply discount code SAVE15".into(),
            preconditions: vec![],
            steps,
            category: Category::Positive,
            evidence_chunk_ids: ids.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn step(action: &str, hint: &str, expected: &str) -> TestStep {
        TestStep {
            action: action.into(),
            target_hint: hint.into(),
            expected_result: expected.into(),
        }
    }

    #[test]
    fn grounded_case_passes() {
        let tc = case(
            vec![
                step("Enter 'SAVE15'", "#discount-code", "Code is accepted"),
                step("Click apply", "input#apply-discount", "15% discount applied to the order total"),
            ],
            &["chk-doc", "chk-ui"],
        );
        let violations = validate_test_cases(&[tc], &evidence(), &GroundingPolicy::default());
        assert!(violations.is_empty(), "{violations:?}");
    }

    #[test]
    fn empty_and_unknown_evidence_rejected() {
        let tc = case(vec![step("Enter code", "discount code", "ok")], &[]);
        let v = validate_test_cases(&[tc], &evidence(), &GroundingPolicy::default());
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].field, "evidence_chunk_ids");

        let tc = case(vec![step("Enter code", "discount code", "ok")], &["chk-doc", "chk-ghost"]);
        let v = validate_test_cases(&[tc], &evidence(), &GroundingPolicy::default());
        assert!(v.iter().any(|v| v.detail.contains("chk-ghost")));
    }

    #[test]
    fn invented_number_and_literal_rejected() {
        let tc = case(
            vec![step("Enter 'SAVE20'", "discount code", "20% discount applied")],
            &["chk-doc"],
        );
        let v = validate_test_cases(&[tc], &evidence(), &GroundingPolicy::default());
        assert!(v.iter().any(|v| v.detail.contains("'SAVE20'")));
        assert!(v.iter().any(|v| v.detail.contains("number '20'")));
    }

    #[test]
    fn selector_must_come_from_cited_markup() {
        let tc = case(vec![step("Enter SAVE15", "#promo-input", "discount")], &["chk-doc", "chk-ui"]);
        let v = validate_test_cases(&[tc], &evidence(), &GroundingPolicy::default());
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].field, "steps[0].target_hint");

        // A real selector from an uncited chunk is still rejected.
        let tc = case(vec![step("Enter SAVE15", "#discount-code", "discount")], &["chk-doc"]);
        let v = validate_test_cases(&[tc], &evidence(), &GroundingPolicy::default());
        assert!(v.iter().any(|v| v.field == "steps[0].target_hint"));
    }

    #[test]
    fn unrelated_vocabulary_rejected() {
        let tc = case(
            vec![step("Enter SAVE15", "discount code", "Loyalty points redeemed for gift vouchers")],
            &["chk-doc"],
        );
        let v = validate_test_cases(&[tc], &evidence(), &GroundingPolicy::default());
        assert!(v.iter().any(|v| v.field == "steps[0].expected_result"));
    }

    #[test]
    fn threshold_is_tunable() {
        let tc = case(
            vec![step("Enter SAVE15", "discount code", "Loyalty points redeemed for gift vouchers")],
            &["chk-doc"],
        );
        let lenient = GroundingPolicy {
            min_token_overlap: 0.0,
            ..GroundingPolicy::default()
        };
        assert!(validate_test_cases(&[tc], &evidence(), &lenient).is_empty());
    }

    #[test]
    fn ui_queries_detected() {
        assert!(references_ui("What happens when the user clicks the Apply button?"));
        assert!(references_ui("discount code field validation"));
        assert!(!references_ui("shipping cost rules for express delivery"));
    }

    #[test]
    fn literal_and_number_scanning() {
        assert_eq!(quoted_literals("the user's code 'SAVE15' and \"Pay Now\""), vec!["SAVE15", "Pay Now"]);
        assert_eq!(numbers("Total $1,250.50 after 15% off, SAVE15"), vec!["1250.50", "15", "15"]);
    }

    #[test]
    fn selector_shapes() {
        assert!(looks_like_selector("#discount-code"));
        assert!(looks_like_selector("input#email"));
        assert!(looks_like_selector("input[name=\"email\"]"));
        assert!(looks_like_selector("#checkout > button:nth-of-type(2)"));
        assert!(!looks_like_selector("Discount code field"));
        assert!(!looks_like_selector("Pay Now button"));
    }
}
