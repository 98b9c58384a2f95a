//! Entry points tying the components together for one configuration.
//!
//! ```text
//! documents + markup ──► chunk ──► embed ──► index ──publish──► KnowledgeBase
//!                                                                   │
//! query ──► Orchestrator ──search──────────────────────────────────┤
//!              └──► TestCase ──► ScriptSynthesizer ──search(markup)─┘
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use qa_harness_core::embedding::EmbeddingProvider;
use qa_harness_core::generation::GenerationProvider;
use qa_harness_core::models::{AutomationScript, SourceDocument, TestCase};
use qa_harness_core::QaResult;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::embedding::{create_provider, Embedder};
use crate::generation::{create_generation_provider, Generator};
use crate::knowledge_base::{BuildSummary, KnowledgeBase, MarkupPage};
use crate::orchestrator::{GeneratedTestCases, Orchestrator, TestCaseRequest};
use crate::synthesizer::ScriptSynthesizer;

pub struct Pipeline {
    config: Config,
    embedder: Embedder,
    orchestrator: Orchestrator,
    synthesizer: ScriptSynthesizer,
}

impl Pipeline {
    /// Assemble a pipeline around explicit capability providers.
    pub fn new(
        config: Config,
        embedding: Arc<dyn EmbeddingProvider>,
        generation: Arc<dyn GenerationProvider>,
    ) -> Self {
        let embedder = Embedder::new(embedding, &config.embedding, config.retry.clone());
        let generator = Generator::new(generation, &config.generation, config.retry.clone());
        let orchestrator = Orchestrator::new(
            embedder.clone(),
            generator.clone(),
            config.retrieval.clone(),
            config.grounding.clone(),
            config.generation.max_corrections,
        );
        let synthesizer = ScriptSynthesizer::new(
            embedder.clone(),
            generator,
            config.retrieval.script_k,
            config.generation.max_corrections,
        );
        Self {
            config,
            embedder,
            orchestrator,
            synthesizer,
        }
    }

    /// Assemble a pipeline with the providers named in `config`.
    pub fn from_config(config: Config) -> Result<Self> {
        let embedding = create_provider(&config.embedding).context("creating embedding provider")?;
        let generation =
            create_generation_provider(&config.generation).context("creating generation provider")?;
        Ok(Self::new(config, embedding, generation))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn build_knowledge_base(
        &self,
        kb: &KnowledgeBase,
        documents: &[SourceDocument],
        markup: Option<&MarkupPage>,
        cancel: &CancellationToken,
    ) -> QaResult<BuildSummary> {
        kb.build(documents, markup, &self.config.chunking, &self.embedder, cancel)
            .await
    }

    pub async fn query(
        &self,
        kb: &KnowledgeBase,
        request: &TestCaseRequest,
        cancel: &CancellationToken,
    ) -> QaResult<GeneratedTestCases> {
        self.orchestrator.generate_test_cases(kb, request, cancel).await
    }

    pub async fn generate_script(
        &self,
        kb: &KnowledgeBase,
        test_case: &TestCase,
        cancel: &CancellationToken,
    ) -> QaResult<AutomationScript> {
        self.synthesizer.generate_script(kb, test_case, cancel).await
    }
}
