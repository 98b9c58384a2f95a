//! # QA Harness Core
//!
//! Shared, WASM-safe logic for QA Harness: data models, text and markup
//! chunking, the embedding and generation capability traits, the in-memory
//! vector index, prompt construction, strict response parsing, grounding
//! validation, and the retry-with-correction state machine.
//!
//! This crate contains no tokio, network, filesystem I/O, or other
//! native-only dependencies. It compiles to both native targets and
//! `wasm32-unknown-unknown`.

pub mod chunk;
pub mod correction;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod grounding;
pub mod index;
pub mod markup;
pub mod models;
pub mod parse;
pub mod prompt;
pub mod selectors;

pub use error::{CapabilityError, QaError, QaResult, Violation};
