//! # QA Harness CLI (`qah`)
//!
//! ## Usage
//!
//! ```bash
//! qah --config ./config/qah.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `qah generate` | Build from files, generate test cases, optionally scripts |
//! | `qah chunks <file>` | Print the chunks of a document or markup page |
//! | `qah serve` | Start the JSON HTTP API |
//! | `qah completions <shell>` | Print shell completions |
//!
//! ## Examples
//!
//! ```bash
//! qah generate --doc docs/checkout.md --markup site/checkout.html \
//!     --query "generate negative test cases for the discount code feature" \
//!     --scripts-dir out/
//!
//! qah chunks site/checkout.html
//!
//! RUST_LOG=qa_harness=debug qah serve --log-json
//! ```

use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tokio_util::sync::CancellationToken;

use qa_harness::commands::{run_chunks, run_generate, GenerateArgs};
use qa_harness::config;
use qa_harness::pipeline::Pipeline;
use qa_harness::{logging, server};

/// QA Harness: evidence-grounded test cases and Selenium scripts from
/// product documentation and a target page.
#[derive(Parser)]
#[command(name = "qah", version, about)]
struct Cli {
    /// Path to configuration file (TOML). A missing file means defaults.
    #[arg(long, global = true, default_value = "./config/qah.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a knowledge base from files and generate test cases.
    ///
    /// Test cases are printed to stdout as JSON.
    Generate {
        /// Product document (.md, .txt, .json, .pdf, .docx). Repeatable.
        #[arg(long = "doc")]
        documents: Vec<PathBuf>,
        /// HTML page of the UI under test.
        #[arg(long)]
        markup: Option<PathBuf>,
        /// What to test, in natural language.
        #[arg(long, short)]
        query: String,
        /// Maximum number of test cases (1-50).
        #[arg(long)]
        max_test_cases: Option<usize>,
        /// Retrieval depth.
        #[arg(long, short)]
        k: Option<usize>,
        /// Also write one Selenium script per test case into this directory.
        #[arg(long)]
        scripts_dir: Option<PathBuf>,
    },

    /// Print the chunks of a document or an HTML page.
    Chunks {
        path: PathBuf,
        /// Print chunks as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Start the HTTP API on `[server].bind`.
    Serve,

    /// Print shell completions.
    Completions { shell: Shell },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "qah", &mut std::io::stdout());
        return Ok(());
    }

    logging::init(cli.log_json);
    let cfg = config::load_config_or_default(&cli.config)?;

    match cli.command {
        Commands::Generate {
            documents,
            markup,
            query,
            max_test_cases,
            k,
            scripts_dir,
        } => {
            let pipeline = Pipeline::from_config(cfg)?;
            let cancel = CancellationToken::new();
            let ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    ctrl_c.cancel();
                }
            });
            let args = GenerateArgs {
                documents,
                markup,
                query,
                max_test_cases,
                k,
                scripts_dir,
            };
            run_generate(&pipeline, &args, &cancel, &mut std::io::stdout()).await?;
        }
        Commands::Chunks { path, json } => {
            run_chunks(&cfg, &path, json, &mut std::io::stdout())?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}
