//! Fake capability providers and fixtures shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use qa_harness::config::Config;
use qa_harness::embedding::HashEmbedder;
use qa_harness::extract::parse_markup;
use qa_harness::knowledge_base::{KnowledgeBase, MarkupPage};
use qa_harness::pipeline::Pipeline;
use qa_harness_core::embedding::EmbeddingProvider;
use qa_harness_core::generation::{GenerationProvider, GenerationRequest};
use qa_harness_core::models::{SourceDocument, SourceKind};
use qa_harness_core::CapabilityError;
use tokio::sync::Notify;

pub const DISCOUNT_RULE: &str =
    "Discount codes under 10 characters are rejected with error 'Invalid code'.";

pub const CHECKOUT_HTML: &str = r#"<html><body>
<form id="checkout">
  <label for="discount-code">Discount code</label>
  <input id="discount-code" name="discount" type="text">
  <button id="apply-discount" type="button">Apply</button>
</form>
</body></html>"#;

pub fn product_docs() -> Vec<SourceDocument> {
    vec![SourceDocument::new(
        "product-spec.md",
        format!("# Checkout\n\n{}\nShipping is free for orders over 50 dollars.", DISCOUNT_RULE),
    )]
}

pub fn checkout_page() -> MarkupPage {
    MarkupPage {
        id: "checkout.html".to_string(),
        root: parse_markup(CHECKOUT_HTML).expect("fixture markup parses"),
    }
}

/// Config with fast retries so failure paths finish quickly.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 2;
    config.embedding.max_retries = 2;
    config.generation.max_retries = 1;
    config
}

/// Generation provider replaying queued responses and recording requests.
#[derive(Default)]
pub struct ScriptedGenerator {
    responses: Mutex<VecDeque<String>>,
    pub requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub fn push(&self, response: impl Into<String>) {
        self.responses.lock().push_back(response.into());
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl GenerationProvider for ScriptedGenerator {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, CapabilityError> {
        self.requests.lock().push(request.clone());
        self.responses
            .lock()
            .pop_front()
            .ok_or_else(|| CapabilityError::Permanent("no scripted response left".to_string()))
    }
}

/// Hash embeddings that can be made to fail transiently or to wait for a
/// release signal.
pub struct ControlledEmbedder {
    inner: HashEmbedder,
    pub fail: AtomicBool,
    pub gated: AtomicBool,
    pub release: Notify,
    pub calls: AtomicU32,
}

impl ControlledEmbedder {
    pub fn new() -> Self {
        Self {
            inner: HashEmbedder::new(128),
            fail: AtomicBool::new(false),
            gated: AtomicBool::new(false),
            release: Notify::new(),
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for ControlledEmbedder {
    fn model_name(&self) -> &str {
        "controlled"
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(CapabilityError::Transient("503 service unavailable".to_string()));
        }
        if self.gated.load(Ordering::SeqCst) {
            self.release.notified().await;
        }
        self.inner.embed(texts).await
    }
}

pub struct Harness {
    pub pipeline: Arc<Pipeline>,
    pub embedder: Arc<ControlledEmbedder>,
    pub generator: Arc<ScriptedGenerator>,
}

pub fn harness() -> Harness {
    let embedder = Arc::new(ControlledEmbedder::new());
    let generator = Arc::new(ScriptedGenerator::default());
    let pipeline = Arc::new(Pipeline::new(test_config(), embedder.clone(), generator.clone()));
    Harness {
        pipeline,
        embedder,
        generator,
    }
}

/// Id of the first indexed chunk of `kind` whose text contains `needle`.
pub fn chunk_id(kb: &KnowledgeBase, kind: SourceKind, needle: &str) -> String {
    kb.query_snapshot()
        .expect("knowledge base is ready")
        .chunks()
        .find(|c| c.source_kind == kind && c.text.contains(needle))
        .map(|c| c.id.clone())
        .expect("chunk present")
}

/// A grounded negative test case for the discount code rule.
pub fn discount_case_json(evidence_id: &str) -> String {
    serde_json::json!({
        "test_cases": [{
            "id": "TC-1",
            "title": "Discount code under 10 characters is rejected",
            "preconditions": [],
            "steps": [{
                "action": "Enter a discount code shorter than 10 characters",
                "target_hint": "discount code",
                "expected_result": "The code is rejected with error 'Invalid code'"
            }],
            "category": "negative",
            "evidence_chunk_ids": [evidence_id]
        }]
    })
    .to_string()
}

/// Same case, but expecting an error message the evidence never mentions.
pub fn invented_case_json(evidence_id: &str) -> String {
    discount_case_json(evidence_id).replace("'Invalid code'", "'Code expired'")
}

pub const GROUNDED_SCRIPT: &str = r##"```python
from selenium import webdriver
from selenium.webdriver.common.by import By

driver = webdriver.Chrome()
driver.get("http://localhost:8000/checkout")
code_input = driver.find_element(By.CSS_SELECTOR, "#discount-code")
code_input.send_keys("SAVE1")
driver.find_element(By.ID, "apply-discount").click()
assert "Invalid code" in driver.page_source
driver.quit()
```"##;

pub fn ungrounded_script() -> String {
    GROUNDED_SCRIPT.replace("By.ID, \"apply-discount\"", "By.ID, \"coupon-submit\"")
}
