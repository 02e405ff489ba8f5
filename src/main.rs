//! # docqa CLI
//!
//! The `docqa` binary serves the HTTP API and offers local commands for
//! trying the pipeline without a server.
//!
//! ## Usage
//!
//! ```bash
//! docqa --config ./config/docqa.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docqa serve` | Start the HTTP API |
//! | `docqa chunk <file>` | Extract and chunk a file, print the plan and chunks |
//! | `docqa ask <file> "<question>"` | Ingest a file locally and answer one question |
//! | `docqa token <user_id>` | Mint a bearer token for the configured secret |
//!
//! Logs go to stderr; set `RUST_LOG` to adjust verbosity.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use docqa::answer::{Answerer, AskRequest};
use docqa::chunk::{self, ChunkPlan};
use docqa::config::{self, Config};
use docqa::identity::HmacTokenVerifier;
use docqa::llm;
use docqa::loader::Loader;
use docqa::manager::DocumentStoreManager;
use docqa::models::DocumentStatus;
use docqa::server;

/// User id that owns documents ingested by `docqa ask`.
const LOCAL_USER: &str = "local";

#[derive(Parser)]
#[command(
    name = "docqa",
    about = "docqa: ask questions about your documents",
    version,
    long_about = "docqa ingests uploaded documents into per-user, per-document vector indices \
    with adaptive chunking, and answers questions grounded strictly in the retrieved chunks."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/docqa.toml`. `chunk` falls back to built-in
    /// defaults when the file does not exist.
    #[arg(long, global = true, default_value = "./config/docqa.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API on `[server].bind`.
    Serve,

    /// Extract and chunk a file without embedding it.
    ///
    /// Prints the selected band, the document length and one line per chunk.
    Chunk {
        file: PathBuf,

        /// Print full chunk text instead of a one-line preview.
        #[arg(long)]
        full: bool,
    },

    /// Ingest a file locally and answer a single question about it.
    Ask {
        file: PathBuf,

        question: String,

        /// Number of chunks to retrieve (defaults to `[retrieval].default_k`).
        #[arg(long)]
        k: Option<usize>,

        /// Plain similarity ranking instead of MMR.
        #[arg(long)]
        no_mmr: bool,
    },

    /// Mint a bearer token for a user id.
    Token { user_id: String },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docqa=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Commands::Serve => {
            let cfg = config::load_config(&cli.config)?;
            server::run_server(&cfg).await?;
        }
        Commands::Chunk { file, full } => {
            let cfg = load_or_default(&cli.config)?;
            run_chunk(&cfg, &file, full)?;
        }
        Commands::Ask {
            file,
            question,
            k,
            no_mmr,
        } => {
            let cfg = config::load_config(&cli.config)?;
            run_ask(&cfg, &file, question, k, !no_mmr).await?;
        }
        Commands::Token { user_id } => {
            let cfg = load_or_default(&cli.config)?;
            let secret = cfg
                .server
                .resolved_auth_secret()
                .context("server.auth_secret (or DOCQA_AUTH_SECRET) must be set to mint tokens")?;
            let verifier = HmacTokenVerifier::new(secret)?;
            println!("{}", verifier.issue(&user_id));
        }
    }

    Ok(())
}

fn load_or_default(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        config::load_config(path)
    } else {
        tracing::debug!(path = %path.display(), "config not found, using defaults");
        Ok(Config::default())
    }
}

fn run_chunk(cfg: &Config, file: &Path, full: bool) -> anyhow::Result<()> {
    let loader = Loader::for_path(file)?;
    let segments = loader
        .load(file)
        .with_context(|| format!("Failed to load {}", file.display()))?;
    let total = chunk::char_length(&segments);
    let plan = ChunkPlan::for_length(total, &cfg.chunking);
    let pieces = chunk::split(&segments, &plan);

    println!("file:        {}", file.display());
    println!("segments:    {}", segments.len());
    println!("length:      {} chars (~{} tokens)", total, chunk::estimate_tokens(total));
    println!(
        "band:        {} (chunk_size={}, overlap={}{})",
        plan.band,
        plan.chunk_size,
        plan.chunk_overlap,
        if plan.split { "" } else { ", not split" }
    );
    println!("chunks:      {}", pieces.len());
    println!();

    for (i, piece) in pieces.iter().enumerate() {
        let len = piece.text.chars().count();
        if full {
            println!("--- chunk {} (segment {}, {} chars) ---", i, piece.segment, len);
            println!("{}", piece.text);
        } else {
            let line: String = piece.text.split_whitespace().collect::<Vec<_>>().join(" ");
            println!(
                "[{:>3}] seg={} len={:>5}  {}",
                i,
                piece.segment,
                len,
                docqa::answer::preview(&line, 60)
            );
        }
    }
    Ok(())
}

async fn run_ask(
    cfg: &Config,
    file: &Path,
    question: String,
    k: Option<usize>,
    use_mmr: bool,
) -> anyhow::Result<()> {
    let filename = file
        .file_name()
        .and_then(|n| n.to_str())
        .context("file path has no file name")?
        .to_string();
    let bytes =
        std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;

    let manager = DocumentStoreManager::from_config(cfg).await?;
    let model = llm::create_model(&cfg.llm)?;
    let answerer = Answerer::new(Arc::clone(&manager), model, cfg.retrieval.clone());

    let (receipt, handle) = manager.upload(bytes, &filename, LOCAL_USER).await?;
    handle.wait().await;

    let status = manager.status(&receipt.document_id, LOCAL_USER).await?;
    if status.status == DocumentStatus::Error {
        bail!(
            "Ingestion failed: {}",
            status.error.unwrap_or_else(|| "unknown error".to_string())
        );
    }
    eprintln!(
        "Ingested {} ({} chunks)",
        filename,
        status.chunks_count.unwrap_or(0)
    );

    let request = AskRequest {
        question,
        document_id: receipt.document_id.clone(),
        use_mmr,
        k: k.unwrap_or(cfg.retrieval.default_k),
    };
    let response = answerer.answer(&request, LOCAL_USER).await?;

    println!("{}", response.answer.trim());
    println!();
    println!("Sources ({} chunks):", response.chunks_used);
    for source in &response.source_documents {
        let line: String = source
            .content
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        println!("  [{}] {}: {}", source.chunk_index, source.filename, line);
    }

    // The local document only lives for this run.
    manager.delete(&receipt.document_id, LOCAL_USER).await?;
    Ok(())
}
