//! Exponential backoff for capability calls.
//!
//! Only [`CapabilityError::Transient`] failures are retried. The delay before
//! retry `n` is `base_delay_ms × 2^(n-1)`, capped at `max_delay_ms`.
//! Cancellation is observed before every attempt and during every sleep.

use std::future::Future;

use qa_harness_core::CapabilityError;
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;

/// Classify a non-success HTTP response: 429 and 5xx are transient.
pub fn classify_status(service: &str, status: reqwest::StatusCode, body: &str) -> CapabilityError {
    let message = format!("{} API error {}: {}", service, status, body);
    if status.as_u16() == 429 || status.is_server_error() {
        CapabilityError::Transient(message)
    } else {
        CapabilityError::Permanent(message)
    }
}

/// Classify a transport failure: timeouts and connection errors are transient.
pub fn classify_transport(service: &str, err: &reqwest::Error) -> CapabilityError {
    let message = format!("{} request failed: {}", service, err);
    if err.is_timeout() || err.is_connect() || err.is_request() {
        CapabilityError::Transient(message)
    } else {
        CapabilityError::Permanent(message)
    }
}

/// Why a retried call gave up.
#[derive(Debug, Clone)]
pub enum RetryError {
    /// The last error, after `attempts` calls.
    Failed {
        attempts: u32,
        last: CapabilityError,
    },
    Cancelled,
}

/// Run `op` until it succeeds, fails permanently, or `max_retries` retries
/// are used up.
pub async fn with_backoff<T, F, Fut>(
    policy: &RetryConfig,
    max_retries: u32,
    label: &str,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CapabilityError>>,
{
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        attempt += 1;
        let result = tokio::select! {
            r = op() => r,
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
        };
        let err = match result {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };

        if !err.is_transient() || attempt > max_retries {
            return Err(RetryError::Failed {
                attempts: attempt,
                last: err,
            });
        }

        let delay = policy.delay(attempt);
        tracing::warn!(
            call = label,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient capability failure, backing off"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
        }
    }
}
