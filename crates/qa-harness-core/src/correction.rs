//! Bounded retry-with-correction for generation stages.
//!
//! ```text
//!   Attempt ──► Validate ──► Accept
//!      ▲           │
//!      │           ├──► CorrectAndRetry (while corrections remain)
//!      └───────────┘
//!                  └──► Fail
//! ```
//!
//! Each rejected attempt feeds its concrete problems back to the generator
//! as a corrective instruction appended to the original request. Capability
//! failures are not handled here: they abort the loop through the
//! generator's own error.

use std::future::Future;

use crate::error::{QaResult, Violation};
use crate::generation::GenerationRequest;
use crate::prompt::{parse_correction, violations_correction};

/// Corrective retries allowed after the first attempt.
pub const DEFAULT_MAX_CORRECTIONS: u32 = 1;

/// Verdict on one generated response.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict<T> {
    Accept(T),
    ParseFailed(String),
    Ungrounded(Vec<Violation>),
}

/// Why the final attempt was rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    ParseFailed(String),
    Ungrounded(Vec<Violation>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CorrectionOutcome<T> {
    Accepted { value: T, attempts: u32 },
    Rejected { rejection: Rejection, attempts: u32 },
}

fn into_result<T>(verdict: Verdict<T>) -> Result<T, Rejection> {
    match verdict {
        Verdict::Accept(value) => Ok(value),
        Verdict::ParseFailed(reason) => Err(Rejection::ParseFailed(reason)),
        Verdict::Ungrounded(violations) => Err(Rejection::Ungrounded(violations)),
    }
}

enum Step<T> {
    Attempt(GenerationRequest),
    Validate(String),
    CorrectAndRetry(String),
    Accept(T),
    Fail(Rejection),
}

/// Drive the correction state machine for one request.
///
/// `generate` performs one generation call; `validate` parses and checks the
/// raw response.
pub async fn generate_with_correction<T, G, Fut, V>(
    request: &GenerationRequest,
    max_corrections: u32,
    mut generate: G,
    mut validate: V,
) -> QaResult<CorrectionOutcome<T>>
where
    G: FnMut(GenerationRequest) -> Fut,
    Fut: Future<Output = QaResult<String>>,
    V: FnMut(&str) -> Verdict<T>,
{
    let mut attempts = 0u32;
    let mut step = Step::Attempt(request.clone());
    loop {
        step = match step {
            Step::Attempt(req) => {
                attempts += 1;
                Step::Validate(generate(req).await?)
            }
            Step::Validate(raw) => match into_result(validate(&raw)) {
                Ok(value) => Step::Accept(value),
                Err(rejection) if attempts > max_corrections => Step::Fail(rejection),
                Err(rejection) => {
                    let correction = match &rejection {
                        Rejection::ParseFailed(reason) => {
                            parse_correction(reason, request.expects_json())
                        }
                        Rejection::Ungrounded(v) => violations_correction(v),
                    };
                    tracing::info!(
                        stage = %request.stage,
                        attempt = attempts,
                        rejection = ?rejection,
                        "response rejected, retrying with correction"
                    );
                    Step::CorrectAndRetry(correction)
                }
            },
            Step::CorrectAndRetry(correction) => Step::Attempt(request.with_correction(&correction)),
            Step::Accept(value) => return Ok(CorrectionOutcome::Accepted { value, attempts }),
            Step::Fail(rejection) => {
                tracing::warn!(
                    stage = %request.stage,
                    attempts,
                    rejection = ?rejection,
                    "response rejected after corrective retries"
                );
                return Ok(CorrectionOutcome::Rejected { rejection, attempts });
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::error::QaError;
    use crate::generation::ResponseFormat;

    fn request() -> GenerationRequest {
        GenerationRequest {
            stage: "test".into(),
            system: "sys".into(),
            prompt: "base prompt".into(),
            format: ResponseFormat::Json {
                schema: serde_json::json!({}),
            },
        }
    }

    fn verdict(raw: &str) -> Verdict<String> {
        match raw {
            "good" => Verdict::Accept(raw.to_string()),
            "garbage" => Verdict::ParseFailed("invalid JSON".into()),
            _ => Verdict::Ungrounded(vec![Violation {
                subject: "TC-1".into(),
                field: "title".into(),
                detail: "made up".into(),
            }]),
        }
    }

    #[tokio::test]
    async fn accepts_first_good_response() {
        let outcome = generate_with_correction(&request(), 1, |_| async { Ok("good".to_string()) }, verdict)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            CorrectionOutcome::Accepted {
                value: "good".into(),
                attempts: 1
            }
        );
    }

    #[tokio::test]
    async fn corrects_once_then_accepts() {
        let prompts = Mutex::new(Vec::new());
        let responses = Mutex::new(vec!["good", "ungrounded"]);
        let outcome = generate_with_correction(
            &request(),
            1,
            |req| {
                prompts.lock().unwrap().push(req.prompt.clone());
                let next = responses.lock().unwrap().pop().unwrap().to_string();
                async move { Ok(next) }
            },
            verdict,
        )
        .await
        .unwrap();
        assert!(matches!(outcome, CorrectionOutcome::Accepted { attempts: 2, .. }));
        let prompts = prompts.into_inner().unwrap();
        assert_eq!(prompts[0], "base prompt");
        assert!(prompts[1].starts_with("base prompt\n\n"));
        assert!(prompts[1].contains("TC-1 title: made up"));
    }

    #[tokio::test]
    async fn fails_after_single_correction() {
        let calls = Mutex::new(0);
        let outcome = generate_with_correction(
            &request(),
            1,
            |_| {
                *calls.lock().unwrap() += 1;
                async { Ok("garbage".to_string()) }
            },
            verdict,
        )
        .await
        .unwrap();
        assert_eq!(*calls.lock().unwrap(), 2);
        match outcome {
            CorrectionOutcome::Rejected {
                rejection: Rejection::ParseFailed(reason),
                attempts,
            } => {
                assert_eq!(attempts, 2);
                assert_eq!(reason, "invalid JSON");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn capability_errors_abort() {
        let result = generate_with_correction(
            &request(),
            1,
            |_| async {
                Err::<String, _>(QaError::GenerationUnavailable {
                    stage: "test".into(),
                    attempts: 3,
                    message: "down".into(),
                })
            },
            verdict,
        )
        .await;
        assert!(matches!(result, Err(QaError::GenerationUnavailable { .. })));
    }
}
