//! # QA Harness
//!
//! Retrieval-grounded generation of QA artifacts: structured test cases and
//! Selenium scripts whose every claim and element reference is traceable to
//! ingested product documentation and the markup of the page under test.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────────┐
//! │  Documents  │──▶│ Chunk+Embed  │──▶│ VectorIndex  │
//! │  + Markup   │   │  (batched)   │   │  (snapshot)  │
//! └─────────────┘   └──────────────┘   └──────┬───────┘
//!                                             │ search
//!                    ┌────────────────────────┤
//!                    ▼                        ▼
//!             ┌──────────────┐        ┌───────────────┐
//!             │ Orchestrator │──tc──▶ │  Synthesizer  │
//!             │ (test cases) │        │  (scripts)    │
//!             └──────────────┘        └───────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`embedding`] | Embedding providers and the batching [`embedding::Embedder`] |
//! | [`generation`] | Generation providers and the retrying [`generation::Generator`] |
//! | [`retry`] | Exponential backoff for capability calls |
//! | [`extract`] | Document text and HTML structure extraction |
//! | [`knowledge_base`] | Build lifecycle and snapshot publication |
//! | [`orchestrator`] | Evidence-grounded test case generation |
//! | [`synthesizer`] | Selector-grounded script synthesis |
//! | [`pipeline`] | Entry points over one configuration |
//! | [`server`] | JSON HTTP API |
//! | [`commands`] | CLI commands |
//! | [`logging`] | Tracing subscriber setup |
//!
//! Core types and pure logic live in [`qa_harness_core`].

pub mod commands;
pub mod config;
pub mod embedding;
pub mod extract;
pub mod generation;
pub mod knowledge_base;
pub mod logging;
pub mod orchestrator;
pub mod pipeline;
pub mod retry;
pub mod server;
pub mod synthesizer;

pub use qa_harness_core;
