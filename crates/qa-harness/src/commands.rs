//! CLI command implementations.
//!
//! Kept in the library so they can be driven from tests with injected
//! providers and in-memory writers.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use qa_harness_core::chunk::ChunkSource;
use qa_harness_core::models::{Chunk, SourceDocument};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::extract::{extract_document, parse_markup};
use crate::knowledge_base::{KnowledgeBase, MarkupPage};
use crate::orchestrator::TestCaseRequest;
use crate::pipeline::Pipeline;

/// Inputs of `qah generate`.
#[derive(Debug, Clone)]
pub struct GenerateArgs {
    pub documents: Vec<PathBuf>,
    pub markup: Option<PathBuf>,
    pub query: String,
    pub max_test_cases: Option<usize>,
    pub k: Option<usize>,
    /// Write one `<test case id>.py` script per test case here.
    pub scripts_dir: Option<PathBuf>,
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn is_html(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref(),
        Some("html") | Some("htm")
    )
}

pub fn read_document(path: &Path) -> Result<SourceDocument> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    extract_document(&file_name(path), &bytes).with_context(|| format!("extracting {}", path.display()))
}

pub fn read_markup(path: &Path) -> Result<MarkupPage> {
    let html = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let root = parse_markup(&html).with_context(|| format!("parsing {}", path.display()))?;
    Ok(MarkupPage {
        id: file_name(path),
        root,
    })
}

/// Build a throwaway knowledge base from files, generate test cases, and
/// print them as JSON. With `scripts_dir`, also synthesize one script per
/// test case; a script that fails grounding is reported and skipped.
pub async fn run_generate(
    pipeline: &Pipeline,
    args: &GenerateArgs,
    cancel: &CancellationToken,
    out: &mut dyn Write,
) -> Result<()> {
    if args.documents.is_empty() && args.markup.is_none() {
        bail!("at least one --doc or a --markup page is required");
    }
    let documents = args
        .documents
        .iter()
        .map(|p| read_document(p))
        .collect::<Result<Vec<_>>>()?;
    let markup = args.markup.as_deref().map(read_markup).transpose()?;

    let kb = KnowledgeBase::new("cli");
    pipeline
        .build_knowledge_base(&kb, &documents, markup.as_ref(), cancel)
        .await?;

    let request = TestCaseRequest {
        query: args.query.clone(),
        max_test_cases: args.max_test_cases,
        k: args.k,
    };
    let generated = pipeline.query(&kb, &request, cancel).await?;
    serde_json::to_writer_pretty(&mut *out, &generated.test_cases)?;
    writeln!(out)?;

    let Some(dir) = &args.scripts_dir else {
        return Ok(());
    };
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    for tc in &generated.test_cases {
        match pipeline.generate_script(&kb, tc, cancel).await {
            Ok(script) => {
                let path = dir.join(format!("{}.py", sanitize_file_stem(&tc.id)));
                std::fs::write(&path, &script.source_text)
                    .with_context(|| format!("writing {}", path.display()))?;
                eprintln!("wrote {}", path.display());
            }
            Err(e) => {
                tracing::warn!(test_case = %tc.id, error = %e, "script generation failed");
                eprintln!("skipped {}: {}", tc.id, e);
            }
        }
    }
    Ok(())
}

fn sanitize_file_stem(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Print the chunks of one file: `.html`/`.htm` as markup, anything else as
/// a document.
pub fn run_chunks(config: &Config, path: &Path, json: bool, out: &mut dyn Write) -> Result<()> {
    let chunks: Vec<Chunk> = if is_html(path) {
        let page = read_markup(path)?;
        qa_harness_core::chunk::chunk(
            ChunkSource::Markup(&page.root),
            &page.id,
            &config.chunking.markup_params(),
        )?
    } else {
        let doc = read_document(path)?;
        qa_harness_core::chunk::chunk(ChunkSource::Text(&doc.text), &doc.id, &config.chunking.doc_params())?
    };

    if json {
        serde_json::to_writer_pretty(&mut *out, &chunks)?;
        writeln!(out)?;
        return Ok(());
    }
    for c in &chunks {
        writeln!(
            out,
            "{:>4}  [{}, {})  {}  {}",
            c.sequence_index,
            c.char_span.start,
            c.char_span.end,
            c.source_kind,
            c.id
        )?;
        if !c.selectors().is_empty() {
            writeln!(out, "      selectors: {}", c.selectors().join(", "))?;
        }
    }
    writeln!(out, "{} chunks", chunks.len())?;
    Ok(())
}
