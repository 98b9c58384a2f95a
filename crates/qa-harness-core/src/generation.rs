//! Generation capability trait and request types.
//!
//! A [`GenerationRequest`] carries a system instruction, the user prompt, and
//! the response shape the caller expects. Providers translate it into their
//! own wire format (JSON mode, response MIME type, …) and return raw text;
//! parsing and validation happen in [`crate::parse`] and
//! [`crate::grounding`], never inside a provider.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::CapabilityError;

/// Expected shape of the generated text.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseFormat {
    /// A JSON document conforming to `schema` (a JSON Schema object).
    Json { schema: serde_json::Value },
    /// Source code in `language`.
    Code { language: String },
}

/// A constrained generation request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    /// Pipeline stage, used for logging and error context.
    pub stage: String,
    pub system: String,
    pub prompt: String,
    pub format: ResponseFormat,
}

impl GenerationRequest {
    /// Append a corrective instruction for a retry attempt.
    pub fn with_correction(&self, correction: &str) -> GenerationRequest {
        let mut next = self.clone();
        next.prompt = format!("{}\n\n{}", self.prompt, correction);
        next
    }

    pub fn expects_json(&self) -> bool {
        matches!(self.format, ResponseFormat::Json { .. })
    }
}

/// Opaque text generation capability.
///
/// Assumed non-deterministic across calls with the same prompt. Each call
/// makes one attempt; transient failures are retried by the caller.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"gemini-2.0-flash"`).
    fn model_name(&self) -> &str;
    /// Generate raw text for a request.
    async fn generate(&self, request: &GenerationRequest) -> Result<String, CapabilityError>;
}
