mod common;

use std::fs;
use std::path::Path;
use std::process::Command;

use qa_harness::commands::{run_chunks, run_generate, GenerateArgs};
use qa_harness::config::Config;
use qa_harness_core::models::TestCase;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use common::*;

fn run_qah(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let output = Command::new(env!("CARGO_BIN_EXE_qah"))
        .arg("--config")
        .arg(config_path)
        .args(args)
        .output()
        .expect("qah binary runs");
    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.success(),
    )
}

fn write_fixtures(root: &Path) {
    fs::write(root.join("product-spec.md"), &product_docs()[0].text).unwrap();
    fs::write(root.join("checkout.html"), CHECKOUT_HTML).unwrap();
}

#[test]
fn chunks_command_prints_markup_selectors() {
    let tmp = TempDir::new().unwrap();
    write_fixtures(tmp.path());
    // No config file: defaults apply.
    let (stdout, stderr, ok) = run_qah(
        &tmp.path().join("missing.toml"),
        &["chunks", tmp.path().join("checkout.html").to_str().unwrap()],
    );
    assert!(ok, "stderr: {stderr}");
    assert!(stdout.contains("#discount-code"));
    assert!(stdout.contains("#apply-discount"));
    assert!(stdout.contains("markup"));
}

#[test]
fn chunks_command_rejects_bad_config() {
    let tmp = TempDir::new().unwrap();
    write_fixtures(tmp.path());
    let config = tmp.path().join("qah.toml");
    fs::write(&config, "[chunking]\ndoc_max_size = 100\ndoc_overlap = 100\n").unwrap();
    let (_, stderr, ok) = run_qah(
        &config,
        &["chunks", tmp.path().join("product-spec.md").to_str().unwrap()],
    );
    assert!(!ok);
    assert!(stderr.contains("overlap"));
}

#[test]
fn completions_are_generated() {
    let tmp = TempDir::new().unwrap();
    let (stdout, _, ok) = run_qah(&tmp.path().join("none.toml"), &["completions", "bash"]);
    assert!(ok);
    assert!(stdout.contains("qah"));
}

#[test]
fn chunk_json_covers_the_document() {
    let tmp = TempDir::new().unwrap();
    write_fixtures(tmp.path());
    let mut out = Vec::new();
    run_chunks(&Config::default(), &tmp.path().join("product-spec.md"), true, &mut out).unwrap();
    let chunks: serde_json::Value = serde_json::from_slice(&out).unwrap();
    let chunks = chunks.as_array().unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0]["source_kind"], "doc");
    assert_eq!(chunks[0]["char_span"]["start"], 0);
    assert_eq!(
        chunks[0]["char_span"]["end"].as_u64().unwrap() as usize,
        product_docs()[0].text.chars().count()
    );
}

#[tokio::test]
async fn generate_writes_test_cases_and_scripts() {
    let tmp = TempDir::new().unwrap();
    write_fixtures(tmp.path());
    let h = harness();

    // The chunk id depends only on source id, position, and text.
    let kb = qa_harness::knowledge_base::KnowledgeBase::new("scratch");
    h.pipeline
        .build_knowledge_base(&kb, &product_docs(), None, &CancellationToken::new())
        .await
        .unwrap();
    let doc_chunk = chunk_id(&kb, qa_harness_core::models::SourceKind::Doc, "Invalid code");
    h.generator.push(discount_case_json(&doc_chunk));
    h.generator.push(GROUNDED_SCRIPT);

    let scripts = tmp.path().join("scripts");
    let args = GenerateArgs {
        documents: vec![tmp.path().join("product-spec.md")],
        markup: Some(tmp.path().join("checkout.html")),
        query: "generate negative test cases for the discount code feature".to_string(),
        max_test_cases: Some(3),
        k: None,
        scripts_dir: Some(scripts.clone()),
    };
    let mut out = Vec::new();
    run_generate(&h.pipeline, &args, &CancellationToken::new(), &mut out)
        .await
        .unwrap();

    let cases: Vec<TestCase> = serde_json::from_slice(&out).unwrap();
    assert_eq!(cases.len(), 1);
    let script = fs::read_to_string(scripts.join("TC-1.py")).unwrap();
    assert!(script.contains("By.CSS_SELECTOR, \"#discount-code\""));
}

#[tokio::test]
async fn generate_requires_inputs() {
    let h = harness();
    let args = GenerateArgs {
        documents: vec![],
        markup: None,
        query: "anything at all".to_string(),
        max_test_cases: None,
        k: None,
        scripts_dir: None,
    };
    let mut out = Vec::new();
    assert!(run_generate(&h.pipeline, &args, &CancellationToken::new(), &mut out)
        .await
        .is_err());
}
