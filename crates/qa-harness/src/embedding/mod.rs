//! Embedding providers and the batching, retrying [`Embedder`].
//!
//! Concrete implementations of [`EmbeddingProvider`]:
//! - **[`DisabledProvider`]**: fails every call; used when embeddings are not configured.
//! - **[`OpenAIProvider`]**: calls the OpenAI embeddings API.
//! - **[`OllamaProvider`]**: calls a local Ollama instance's `/api/embed` endpoint.
//! - **[`HashEmbedder`]**: deterministic offline feature hashing.
//! - **`LocalProvider`**: runs models locally via fastembed (feature
//!   `local-embeddings-fastembed`); no network calls after model download.
//!
//! Providers make exactly one attempt per call and classify failures as
//! transient or permanent. [`Embedder`] layers batching and exponential
//! backoff on top and turns exhaustion into
//! [`QaError::EmbeddingUnavailable`].
//!
//! # Provider Selection
//!
//! ```rust,no_run
//! # use qa_harness::config::EmbeddingConfig;
//! # use qa_harness::embedding::create_provider;
//! let config = EmbeddingConfig::default(); // provider = "disabled"
//! let provider = create_provider(&config).unwrap();
//! assert_eq!(provider.model_name(), "disabled");
//! ```

mod hash;

pub use hash::HashEmbedder;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use qa_harness_core::embedding::EmbeddingProvider;
use qa_harness_core::{CapabilityError, QaError, QaResult};
use tokio_util::sync::CancellationToken;

use crate::config::{EmbeddingConfig, RetryConfig};
use crate::retry::{classify_status, classify_transport, with_backoff, RetryError};

const EMBEDDING_STAGE: &str = "embedding";

// ============ Embedder ============

/// Order-preserving, batching, retrying front end for a provider.
#[derive(Clone)]
pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
    max_retries: u32,
    retry: RetryConfig,
}

impl Embedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, config: &EmbeddingConfig, retry: RetryConfig) -> Self {
        Self {
            provider,
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
            retry,
        }
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub fn dims(&self) -> usize {
        self.provider.dims()
    }

    /// Embed `texts`, one vector per input, in input order.
    ///
    /// # Errors
    ///
    /// [`QaError::EmbeddingUnavailable`] when a batch fails permanently,
    /// exhausts its retries, or returns the wrong number or size of vectors;
    /// [`QaError::Cancelled`] when `cancel` fires.
    pub async fn embed(&self, texts: &[String], cancel: &CancellationToken) -> QaResult<Vec<Vec<f32>>> {
        let dims = self.dims();
        let provider: &dyn EmbeddingProvider = self.provider.as_ref();
        let mut out = Vec::with_capacity(texts.len());

        for (batch_idx, batch) in texts.chunks(self.batch_size).enumerate() {
            let batch_offset = batch_idx * self.batch_size;
            let vectors = with_backoff(
                &self.retry,
                self.max_retries,
                "embed",
                cancel,
                move || provider.embed(batch),
            )
            .await
            .map_err(|e| match e {
                RetryError::Cancelled => QaError::Cancelled {
                    stage: EMBEDDING_STAGE.to_string(),
                },
                RetryError::Failed { attempts, last } => QaError::EmbeddingUnavailable {
                    batch_offset,
                    attempts,
                    message: last.message().to_string(),
                },
            })?;

            if vectors.len() != batch.len() {
                return Err(QaError::EmbeddingUnavailable {
                    batch_offset,
                    attempts: 1,
                    message: format!(
                        "provider returned {} vectors for {} inputs",
                        vectors.len(),
                        batch.len()
                    ),
                });
            }
            if let Some((i, v)) = vectors.iter().enumerate().find(|(_, v)| v.len() != dims) {
                return Err(QaError::EmbeddingUnavailable {
                    batch_offset,
                    attempts: 1,
                    message: format!(
                        "vector {} has dimension {}, expected {}",
                        batch_offset + i,
                        v.len(),
                        dims
                    ),
                });
            }

            tracing::debug!(batch_offset, count = batch.len(), "embedded batch");
            out.extend(vectors);
        }
        Ok(out)
    }

    /// Embed a single query text.
    pub async fn embed_query(&self, text: &str, cancel: &CancellationToken) -> QaResult<Vec<f32>> {
        let mut vectors = self.embed(&[text.to_string()], cancel).await?;
        vectors.pop().ok_or_else(|| QaError::EmbeddingUnavailable {
            batch_offset: 0,
            attempts: 1,
            message: "empty embedding response".to_string(),
        })
    }
}

// ============ Disabled Provider ============

/// An embedding provider that always fails.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }

    fn dims(&self) -> usize {
        0
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, CapabilityError> {
        Err(CapabilityError::Permanent(
            "embedding provider is disabled; set [embedding] provider in the config".to_string(),
        ))
    }
}

// ============ OpenAI Provider ============

/// Embedding provider using `POST https://api.openai.com/v1/embeddings`.
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAIProvider {
    model: String,
    dims: usize,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            model,
            dims,
            api_key,
            client,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CapabilityError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let response = self
            .client
            .post("https://api.openai.com/v1/embeddings")
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport("OpenAI", &e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status("OpenAI", status, &text));
        }
        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CapabilityError::Permanent(format!("OpenAI response body: {}", e)))?;
        parse_openai_response(&json)
    }
}

/// Extract `data[].embedding`, ordered by `data[].index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, CapabilityError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| CapabilityError::Permanent("Invalid OpenAI response: missing data array".into()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| CapabilityError::Permanent("Invalid OpenAI response: missing embedding".into()))?;
        indexed.push((index, json_floats(embedding)?));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

fn json_floats(values: &[serde_json::Value]) -> Result<Vec<f32>, CapabilityError> {
    values
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| CapabilityError::Permanent("embedding contains a non-number".into()))
        })
        .collect()
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance (`POST /api/embed`).
pub struct OllamaProvider {
    model: String,
    dims: usize,
    url: String,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            model,
            dims,
            url,
            client,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CapabilityError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let response = self
            .client
            .post(format!("{}/api/embed", self.url.trim_end_matches('/')))
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport(&format!("Ollama at {}", self.url), &e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status("Ollama", status, &text));
        }
        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CapabilityError::Permanent(format!("Ollama response body: {}", e)))?;
        parse_ollama_response(&json)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, CapabilityError> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| {
            CapabilityError::Permanent("Invalid Ollama response: missing embeddings array".into())
        })?;

    embeddings
        .iter()
        .map(|e| {
            e.as_array()
                .ok_or_else(|| {
                    CapabilityError::Permanent("Invalid Ollama response: embedding is not an array".into())
                })
                .and_then(|a| json_floats(a))
        })
        .collect()
}

// ============ Local Provider (fastembed) ============

/// Local inference via fastembed. The model is downloaded on first use and
/// kept loaded for the life of the provider.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalProvider {
    model_name: String,
    dims: usize,
    batch_size: usize,
    model: Arc<parking_lot::Mutex<Option<fastembed::TextEmbedding>>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let (model_name, dims) = resolve_local_model(config);
        config_to_fastembed_model(&model_name)?;
        Ok(Self {
            model_name,
            dims,
            batch_size: config.batch_size,
            model: Arc::new(parking_lot::Mutex::new(None)),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl EmbeddingProvider for LocalProvider {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CapabilityError> {
        let texts = texts.to_vec();
        let slot = Arc::clone(&self.model);
        let model_name = self.model_name.clone();
        let batch_size = self.batch_size;

        tokio::task::spawn_blocking(move || {
            let mut guard = slot.lock();
            if guard.is_none() {
                let model = config_to_fastembed_model(&model_name)
                    .map_err(|e| CapabilityError::Permanent(e.to_string()))?;
                let loaded = fastembed::TextEmbedding::try_new(
                    fastembed::InitOptions::new(model).with_show_download_progress(true),
                )
                .map_err(|e| {
                    CapabilityError::Permanent(format!("Failed to initialize local embedding model: {}", e))
                })?;
                *guard = Some(loaded);
            }
            let model = guard
                .as_mut()
                .ok_or_else(|| CapabilityError::Permanent("local model not loaded".into()))?;
            model
                .embed(texts, Some(batch_size))
                .map_err(|e| CapabilityError::Permanent(format!("Local embedding failed: {}", e)))
        })
        .await
        .map_err(|e| CapabilityError::Transient(format!("embedding task failed: {}", e)))?
    }
}

/// Default model name and dimensionality for the local backend.
pub fn resolve_local_model(config: &EmbeddingConfig) -> (String, usize) {
    let model_name = config
        .model
        .clone()
        .unwrap_or_else(|| "all-minilm-l6-v2".to_string());

    let dims = config.dims.unwrap_or(match model_name.as_str() {
        "bge-base-en-v1.5" | "nomic-embed-text-v1" | "nomic-embed-text-v1.5" => 768,
        "bge-large-en-v1.5" => 1024,
        _ => 384,
    });

    (model_name, dims)
}

#[cfg(feature = "local-embeddings-fastembed")]
fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV1),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        other => bail!(
            "Unknown local embedding model: '{}'. Supported models: all-minilm-l6-v2, \
             bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
             nomic-embed-text-v1, nomic-embed-text-v1.5",
            other
        ),
    }
}

/// Create the [`EmbeddingProvider`] named by `config.provider`.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledProvider`] |
/// | `"openai"` | [`OpenAIProvider`] |
/// | `"ollama"` | [`OllamaProvider`] |
/// | `"hash"` | [`HashEmbedder`] |
/// | `"local"` | `LocalProvider` (feature `local-embeddings-fastembed`) |
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaProvider::new(config)?)),
        "hash" => Ok(Arc::new(HashEmbedder::new(config.dims.unwrap_or(256)))),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Arc::new(LocalProvider::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings-fastembed"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails transiently for the first `fail_first` calls.
    struct Flaky {
        calls: AtomicU32,
        fail_first: u32,
        permanent: bool,
    }

    #[async_trait]
    impl EmbeddingProvider for Flaky {
        fn model_name(&self) -> &str {
            "flaky"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CapabilityError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(if self.permanent {
                    CapabilityError::Permanent("bad request".into())
                } else {
                    CapabilityError::Transient("rate limited".into())
                });
            }
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    fn embedder(provider: Arc<dyn EmbeddingProvider>, batch_size: usize, max_retries: u32) -> Embedder {
        let config = EmbeddingConfig {
            batch_size,
            max_retries,
            ..EmbeddingConfig::default()
        };
        let retry = RetryConfig {
            base_delay_ms: 1,
            max_delay_ms: 2,
        };
        Embedder::new(provider, &config, retry)
    }

    fn texts(n: usize) -> Vec<String> {
        (0..n).map(|i| "x".repeat(i + 1)).collect()
    }

    #[tokio::test]
    async fn batches_preserve_order() {
        let flaky = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            fail_first: 0,
            permanent: false,
        });
        let e = embedder(flaky.clone(), 2, 0);
        let vectors = e.embed(&texts(5), &CancellationToken::new()).await.unwrap();
        assert_eq!(vectors.len(), 5);
        for (i, v) in vectors.iter().enumerate() {
            assert_eq!(v[0], (i + 1) as f32);
        }
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn transient_failures_retried() {
        let flaky = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            fail_first: 2,
            permanent: false,
        });
        let e = embedder(flaky, 8, 3);
        assert!(e.embed(&texts(3), &CancellationToken::new()).await.is_ok());
    }

    #[tokio::test]
    async fn exhaustion_reports_batch_and_attempts() {
        let flaky = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            fail_first: 100,
            permanent: false,
        });
        let e = embedder(flaky, 8, 2);
        match e.embed(&texts(3), &CancellationToken::new()).await {
            Err(QaError::EmbeddingUnavailable {
                batch_offset,
                attempts,
                message,
            }) => {
                assert_eq!(batch_offset, 0);
                assert_eq!(attempts, 3);
                assert!(message.contains("rate limited"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn permanent_failure_not_retried() {
        let flaky = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            fail_first: 1,
            permanent: true,
        });
        let e = embedder(flaky.clone(), 8, 5);
        let err = e.embed(&texts(1), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, QaError::EmbeddingUnavailable { attempts: 1, .. }));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wrong_dimension_rejected() {
        let e = embedder(Arc::new(HashEmbedder::new(4)), 8, 0);
        // HashEmbedder reports 4 dims and returns 4-dim vectors.
        assert!(e.embed(&texts(2), &CancellationToken::new()).await.is_ok());

        struct Liar;
        #[async_trait]
        impl EmbeddingProvider for Liar {
            fn model_name(&self) -> &str {
                "liar"
            }
            fn dims(&self) -> usize {
                3
            }
            async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CapabilityError> {
                Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
            }
        }
        let e = embedder(Arc::new(Liar), 8, 0);
        let err = e.embed(&texts(2), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, QaError::EmbeddingUnavailable { .. }));
    }

    #[test]
    fn parse_openai_orders_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });
        let v = parse_openai_response(&json).unwrap();
        assert_eq!(v, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
        assert!(parse_openai_response(&serde_json::json!({})).is_err());
    }

    #[test]
    fn parse_ollama() {
        let json = serde_json::json!({"embeddings": [[0.5, 0.5]]});
        assert_eq!(parse_ollama_response(&json).unwrap(), vec![vec![0.5, 0.5]]);
    }

    #[test]
    fn disabled_provider_by_default() {
        let p = create_provider(&EmbeddingConfig::default()).unwrap();
        assert_eq!(p.model_name(), "disabled");
    }
}
