//! Generation providers and the retrying [`Generator`].
//!
//! Every provider translates a [`GenerationRequest`] into its own wire
//! format and returns the raw text of the first candidate. JSON requests use
//! the backend's JSON mode; code requests are plain text completions.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use qa_harness_core::generation::{GenerationProvider, GenerationRequest, ResponseFormat};
use qa_harness_core::{CapabilityError, QaError, QaResult};
use tokio_util::sync::CancellationToken;

use crate::config::{GenerationConfig, RetryConfig};
use crate::retry::{classify_status, classify_transport, with_backoff, RetryError};

/// Retrying front end for a [`GenerationProvider`].
#[derive(Clone)]
pub struct Generator {
    provider: Arc<dyn GenerationProvider>,
    max_retries: u32,
    retry: RetryConfig,
}

impl Generator {
    pub fn new(provider: Arc<dyn GenerationProvider>, config: &GenerationConfig, retry: RetryConfig) -> Self {
        Self {
            provider,
            max_retries: config.max_retries,
            retry,
        }
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    /// One logical generation call, retried on transient failures.
    pub async fn generate(&self, request: &GenerationRequest, cancel: &CancellationToken) -> QaResult<String> {
        let provider: &dyn GenerationProvider = self.provider.as_ref();
        with_backoff(&self.retry, self.max_retries, &request.stage, cancel, move || {
            provider.generate(request)
        })
        .await
        .map_err(|e| match e {
            RetryError::Cancelled => QaError::Cancelled {
                stage: request.stage.clone(),
            },
            RetryError::Failed { attempts, last } => QaError::GenerationUnavailable {
                stage: request.stage.clone(),
                attempts,
                message: last.message().to_string(),
            },
        })
    }
}

// ============ Disabled ============

pub struct DisabledGenerator;

#[async_trait]
impl GenerationProvider for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn generate(&self, _request: &GenerationRequest) -> Result<String, CapabilityError> {
        Err(CapabilityError::Permanent(
            "generation provider is disabled; set [generation] provider in the config".to_string(),
        ))
    }
}

fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

async fn post_json(
    service: &str,
    builder: reqwest::RequestBuilder,
    body: &serde_json::Value,
) -> Result<serde_json::Value, CapabilityError> {
    let response = builder
        .json(body)
        .send()
        .await
        .map_err(|e| classify_transport(service, &e))?;
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(classify_status(service, status, &text));
    }
    response
        .json()
        .await
        .map_err(|e| CapabilityError::Permanent(format!("{} response body: {}", service, e)))
}

fn missing(service: &str, what: &str) -> CapabilityError {
    CapabilityError::Permanent(format!("Invalid {} response: missing {}", service, what))
}

// ============ OpenAI ============

/// Chat completions (`POST /v1/chat/completions`), JSON mode for JSON requests.
pub struct OpenAIGenerator {
    model: String,
    temperature: f32,
    api_key: String,
    url: String,
    client: reqwest::Client,
}

impl OpenAIGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generation.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self {
            model,
            temperature: config.temperature,
            api_key,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".to_string()),
            client: http_client(config.timeout_secs)?,
        })
    }

    fn body(&self, request: &GenerationRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.prompt},
            ],
        });
        if request.expects_json() {
            body["response_format"] = serde_json::json!({"type": "json_object"});
        }
        body
    }
}

#[async_trait]
impl GenerationProvider for OpenAIGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, CapabilityError> {
        let builder = self
            .client
            .post(format!("{}/v1/chat/completions", self.url.trim_end_matches('/')))
            .bearer_auth(&self.api_key);
        let json = post_json("OpenAI", builder, &self.body(request)).await?;
        json.pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| missing("OpenAI", "choices[0].message.content"))
    }
}

// ============ Gemini ============

/// Google Gemini `generateContent`; JSON requests set
/// `responseMimeType: application/json` and attach the schema to the prompt.
pub struct GeminiGenerator {
    model: String,
    temperature: f32,
    api_key: String,
    url: String,
    client: reqwest::Client,
}

impl GeminiGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .map_err(|_| anyhow::anyhow!("GEMINI_API_KEY environment variable not set"))?;
        Ok(Self {
            model: config
                .model
                .clone()
                .unwrap_or_else(|| "gemini-2.0-flash".to_string()),
            temperature: config.temperature,
            api_key,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com".to_string()),
            client: http_client(config.timeout_secs)?,
        })
    }

    fn body(&self, request: &GenerationRequest) -> serde_json::Value {
        let mut generation_config = serde_json::json!({ "temperature": self.temperature });
        let mut prompt = request.prompt.clone();
        if let ResponseFormat::Json { schema } = &request.format {
            generation_config["responseMimeType"] = serde_json::json!("application/json");
            prompt = format!("{}\n\nRespond with JSON matching this schema:\n{}", prompt, schema);
        }
        serde_json::json!({
            "systemInstruction": { "parts": [{ "text": request.system }] },
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
            "generationConfig": generation_config,
        })
    }
}

#[async_trait]
impl GenerationProvider for GeminiGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, CapabilityError> {
        let builder = self
            .client
            .post(format!(
                "{}/v1beta/models/{}:generateContent",
                self.url.trim_end_matches('/'),
                self.model
            ))
            .header("x-goog-api-key", &self.api_key);
        let json = post_json("Gemini", builder, &self.body(request)).await?;
        let parts = json
            .pointer("/candidates/0/content/parts")
            .and_then(|p| p.as_array())
            .ok_or_else(|| missing("Gemini", "candidates[0].content.parts"))?;
        Ok(parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join(""))
    }
}

// ============ Ollama ============

/// Local Ollama chat (`POST /api/chat`), `format: json` for JSON requests.
pub struct OllamaGenerator {
    model: String,
    temperature: f32,
    url: String,
    client: reqwest::Client,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generation.model required for Ollama provider"))?;
        Ok(Self {
            model,
            temperature: config.temperature,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            client: http_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl GenerationProvider for OllamaGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, CapabilityError> {
        let mut body = serde_json::json!({
            "model": self.model,
            "stream": false,
            "options": { "temperature": self.temperature },
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.prompt},
            ],
        });
        if request.expects_json() {
            body["format"] = serde_json::json!("json");
        }
        let service = format!("Ollama at {}", self.url);
        let builder = self
            .client
            .post(format!("{}/api/chat", self.url.trim_end_matches('/')));
        let json = post_json(&service, builder, &body).await?;
        json.pointer("/message/content")
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| missing("Ollama", "message.content"))
    }
}

/// Create the [`GenerationProvider`] named by `config.provider`
/// (`disabled`, `openai`, `gemini`, `ollama`).
pub fn create_generation_provider(config: &GenerationConfig) -> Result<Arc<dyn GenerationProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledGenerator)),
        "openai" => Ok(Arc::new(OpenAIGenerator::new(config)?)),
        "gemini" => Ok(Arc::new(GeminiGenerator::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaGenerator::new(config)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}
