//! Configuration parsing and validation.
//!
//! QA Harness is configured via a TOML file (default: `config/qah.toml`).
//! Every section is optional; [`Config::default()`] is a working offline
//! configuration apart from the capability providers, which default to
//! `disabled`.
//!
//! # Example Configuration
//!
//! ```toml
//! [chunking]
//! doc_max_size = 1000
//! doc_overlap = 200
//!
//! [retrieval]
//! default_max_test_cases = 10
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [generation]
//! provider = "gemini"
//! model = "gemini-2.0-flash"
//!
//! [grounding]
//! min_token_overlap = 0.5
//!
//! [server]
//! bind = "127.0.0.1:8000"
//! allowed_origins = ["*"]
//! ```
//!
//! API keys never live in the file: `OPENAI_API_KEY` and `GEMINI_API_KEY`
//! are read from the environment when a provider is created.

use anyhow::{Context, Result};
use qa_harness_core::chunk::ChunkParams;
use qa_harness_core::grounding::GroundingPolicy;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Upper bound on test cases per request.
pub const MAX_TEST_CASES_LIMIT: usize = 50;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub grounding: GroundingPolicy,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_doc_max_size")]
    pub doc_max_size: usize,
    #[serde(default = "default_doc_overlap")]
    pub doc_overlap: usize,
    #[serde(default = "default_markup_max_size")]
    pub markup_max_size: usize,
    #[serde(default = "default_markup_overlap")]
    pub markup_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            doc_max_size: default_doc_max_size(),
            doc_overlap: default_doc_overlap(),
            markup_max_size: default_markup_max_size(),
            markup_overlap: default_markup_overlap(),
        }
    }
}

impl ChunkingConfig {
    pub fn doc_params(&self) -> ChunkParams {
        ChunkParams {
            max_size: self.doc_max_size,
            overlap: self.doc_overlap,
        }
    }

    pub fn markup_params(&self) -> ChunkParams {
        ChunkParams {
            max_size: self.markup_max_size,
            overlap: self.markup_overlap,
        }
    }
}

fn default_doc_max_size() -> usize {
    1000
}
fn default_doc_overlap() -> usize {
    200
}
fn default_markup_max_size() -> usize {
    1500
}
fn default_markup_overlap() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_max_test_cases")]
    pub default_max_test_cases: usize,
    /// Evidence chunks retrieved per requested test case.
    #[serde(default = "default_k_per_test_case")]
    pub k_per_test_case: usize,
    #[serde(default = "default_max_k")]
    pub max_k: usize,
    /// Markup chunks retrieved for script synthesis.
    #[serde(default = "default_script_k")]
    pub script_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_max_test_cases: default_max_test_cases(),
            k_per_test_case: default_k_per_test_case(),
            max_k: default_max_k(),
            script_k: default_script_k(),
        }
    }
}

impl RetrievalConfig {
    /// Retrieval depth for a request that did not name one.
    pub fn default_k(&self, max_test_cases: usize) -> usize {
        (max_test_cases * self.k_per_test_case).min(self.max_k).max(1)
    }
}

fn default_max_test_cases() -> usize {
    10
}
fn default_k_per_test_case() -> usize {
    3
}
fn default_max_k() -> usize {
    20
}
fn default_script_k() -> usize {
    6
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Corrective retries after a parse or grounding rejection.
    #[serde(default = "default_max_corrections")]
    pub max_corrections: u32,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            temperature: default_temperature(),
            max_retries: default_max_retries(),
            max_corrections: default_max_corrections(),
            timeout_secs: default_generation_timeout_secs(),
        }
    }
}

impl GenerationConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_temperature() -> f32 {
    0.2
}
fn default_max_corrections() -> u32 {
    1
}
fn default_generation_timeout_secs() -> u64 {
    120
}

/// Backoff schedule shared by every capability call.
#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based): `base × 2^(attempt-1)`, capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let ms = self.base_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(ms.min(self.max_delay_ms))
    }
}

fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    32_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            allowed_origins: default_allowed_origins(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}
fn default_allowed_origins() -> Vec<String> {
    vec!["*".to_string()]
}

/// Load and validate a configuration file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Load `path` if it exists, otherwise fall back to defaults.
pub fn load_config_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        let config = Config::default();
        validate(&config)?;
        Ok(config)
    }
}

/// Check cross-field invariants the types cannot express.
pub fn validate(config: &Config) -> Result<()> {
    let c = &config.chunking;
    if c.doc_max_size == 0 || c.doc_overlap >= c.doc_max_size {
        anyhow::bail!("chunking.doc_overlap must be smaller than chunking.doc_max_size (> 0)");
    }
    if c.markup_max_size == 0 || c.markup_overlap >= c.markup_max_size {
        anyhow::bail!(
            "chunking.markup_overlap must be smaller than chunking.markup_max_size (> 0)"
        );
    }

    let r = &config.retrieval;
    if !(1..=MAX_TEST_CASES_LIMIT).contains(&r.default_max_test_cases) {
        anyhow::bail!(
            "retrieval.default_max_test_cases must be in [1, {}]",
            MAX_TEST_CASES_LIMIT
        );
    }
    if r.k_per_test_case == 0 || r.max_k == 0 || r.script_k == 0 {
        anyhow::bail!("retrieval.k_per_test_case, max_k, and script_k must be >= 1");
    }

    if !(0.0..=1.0).contains(&config.grounding.min_token_overlap) {
        anyhow::bail!("grounding.min_token_overlap must be in [0.0, 1.0]");
    }

    let e = &config.embedding;
    if e.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be >= 1");
    }
    match e.provider.as_str() {
        "openai" | "ollama" | "hash" => {
            if e.dims.is_none() || e.dims == Some(0) {
                anyhow::bail!("embedding.dims must be > 0 when provider is '{}'", e.provider);
            }
            if e.model.is_none() && e.provider != "hash" {
                anyhow::bail!(
                    "embedding.model must be specified when provider is '{}'",
                    e.provider
                );
            }
        }
        "disabled" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, hash, or local.",
            other
        ),
    }

    let g = &config.generation;
    match g.provider.as_str() {
        "disabled" | "gemini" => {}
        "openai" | "ollama" => {
            if g.model.is_none() {
                anyhow::bail!(
                    "generation.model must be specified when provider is '{}'",
                    g.provider
                );
            }
        }
        other => anyhow::bail!(
            "Unknown generation provider: '{}'. Must be disabled, openai, gemini, or ollama.",
            other
        ),
    }

    if config.retry.max_delay_ms < config.retry.base_delay_ms {
        anyhow::bail!("retry.max_delay_ms must be >= retry.base_delay_ms");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_text: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_text)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn defaults_are_valid() {
        let config = parse("").unwrap();
        assert_eq!(config.chunking.doc_params(), ChunkParams { max_size: 1000, overlap: 200 });
        assert_eq!(config.retrieval.default_max_test_cases, 10);
        assert_eq!(config.grounding.min_token_overlap, 0.5);
        assert!(!config.embedding.is_enabled());
        assert!(!config.generation.is_enabled());
    }

    #[test]
    fn default_k_matches_retrieval_depth_rule() {
        let r = RetrievalConfig::default();
        assert_eq!(r.default_k(1), 3);
        assert_eq!(r.default_k(5), 15);
        assert_eq!(r.default_k(10), 20);
        assert_eq!(r.default_k(50), 20);
    }

    #[test]
    fn overlap_must_be_smaller() {
        let err = parse("[chunking]\ndoc_max_size = 100\ndoc_overlap = 100\n").unwrap_err();
        assert!(err.to_string().contains("doc_overlap"));
    }

    #[test]
    fn network_provider_needs_model_and_dims() {
        assert!(parse("[embedding]\nprovider = \"openai\"\ndims = 1536\n").is_err());
        assert!(parse("[embedding]\nprovider = \"openai\"\nmodel = \"m\"\n").is_err());
        assert!(parse("[embedding]\nprovider = \"hash\"\ndims = 256\n").is_ok());
        assert!(parse("[embedding]\nprovider = \"word2vec\"\n").is_err());
        assert!(parse("[generation]\nprovider = \"gemini\"\n").is_ok());
        assert!(parse("[generation]\nprovider = \"ollama\"\n").is_err());
    }

    #[test]
    fn grounding_threshold_bounds() {
        assert!(parse("[grounding]\nmin_token_overlap = 1.5\n").is_err());
        let config = parse("[grounding]\nmin_token_overlap = 0.25\n").unwrap();
        assert_eq!(config.grounding.min_token_len, 3);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let retry = RetryConfig {
            base_delay_ms: 100,
            max_delay_ms: 500,
        };
        assert_eq!(retry.delay(1), Duration::from_millis(100));
        assert_eq!(retry.delay(2), Duration::from_millis(200));
        assert_eq!(retry.delay(3), Duration::from_millis(400));
        assert_eq!(retry.delay(4), Duration::from_millis(500));
    }
}
