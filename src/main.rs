//! # askdocs CLI
//!
//! The `askdocs` binary ingests a document directory into the vector index,
//! answers questions from the command line, and runs the HTTP chat server.
//!
//! ## Usage
//!
//! ```bash
//! askdocs --config ./config/askdocs.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `askdocs ingest [DIR]` | Chunk, embed and upsert every document under `DIR` |
//! | `askdocs ask "<question>"` | Answer one question with citations |
//! | `askdocs serve` | Start the HTTP chat server |
//! | `askdocs usage` | Show (or reset) a running server's usage counters |
//!
//! ## Examples
//!
//! ```bash
//! # Preview chunk counts without calling any provider
//! askdocs ingest ./documents --dry-run
//!
//! # Ingest into a separate namespace
//! askdocs ingest ./documents --namespace hr-2025
//!
//! askdocs ask "How many vacation days do I get?"
//! askdocs serve
//! ```
//!
//! Log verbosity follows `RUST_LOG` (default `info`). A `.env` file in the
//! working directory is loaded before the configuration.

use anyhow::{bail, Context};
use ask_docs::config::{self, Config};
use ask_docs::context::render_sources_markdown;
use ask_docs::documents::load_documents;
use ask_docs::embedding::EmbeddingAdapter;
use ask_docs::index::create_index;
use ask_docs::ingest::Ingestor;
use ask_docs::models::ChatRequest;
use ask_docs::pipeline::Assistant;
use ask_docs::server;
use ask_docs::usage::UsageCounters;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

/// askdocs: cited question answering over a private document corpus.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/askdocs.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "askdocs",
    about = "Cited question answering over a private document corpus",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/askdocs.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest a document directory into the vector index.
    ///
    /// Re-running over the same documents overwrites the same chunk keys,
    /// so ingestion is idempotent.
    Ingest {
        /// Document root. Defaults to `[documents].root`.
        dir: Option<PathBuf>,

        /// Target namespace. Defaults to `[index].namespace`.
        #[arg(long)]
        namespace: Option<String>,

        /// Chunk and count only: no embedding calls, no index writes.
        #[arg(long)]
        dry_run: bool,
    },

    /// Answer one question and print its sources.
    Ask {
        question: String,
    },

    /// Start the HTTP chat server on `[server].bind`.
    Serve,

    /// Show the usage counters of a running server.
    Usage {
        /// Server base URL. Defaults to the local `[server].bind` address.
        #[arg(long)]
        url: Option<String>,

        /// Zero the counters instead (sends the configured admin secret).
        #[arg(long)]
        reset: bool,
    },
}

impl Commands {
    /// Dry runs and usage queries never call a provider or the index.
    fn needs_credentials(&self) -> bool {
        match self {
            Commands::Ingest { dry_run, .. } => !dry_run,
            Commands::Ask { .. } | Commands::Serve => true,
            Commands::Usage { .. } => false,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = if cli.command.needs_credentials() {
        config::load_config(&cli.config)?
    } else {
        config::load_config_offline(&cli.config)?
    };

    match cli.command {
        Commands::Ingest {
            dir,
            namespace,
            dry_run,
        } => run_ingest(&cfg, dir, namespace, dry_run).await?,
        Commands::Ask { question } => run_ask(&cfg, question).await?,
        Commands::Serve => server::run_server(&cfg).await?,
        Commands::Usage { url, reset } => run_usage(&cfg, url, reset).await?,
    }

    Ok(())
}

async fn run_ingest(
    cfg: &Config,
    dir: Option<PathBuf>,
    namespace: Option<String>,
    dry_run: bool,
) -> anyhow::Result<()> {
    let root = dir.unwrap_or_else(|| cfg.documents.root.clone());
    let namespace = namespace.unwrap_or_else(|| cfg.index.namespace.clone());

    let documents = load_documents(&root, &cfg.documents)?;
    println!("Found {} documents in {}", documents.len(), root.display());

    let summary = if dry_run {
        Ingestor::dry_run(&documents, &cfg.chunking)
    } else {
        let usage = Arc::new(UsageCounters::new());
        let embedder = Arc::new(EmbeddingAdapter::from_config(cfg, usage)?);
        let index = create_index(&cfg.index)?;
        let ingestor = Ingestor::new(
            cfg.chunking.clone(),
            cfg.embedding.batch_size,
            embedder,
            index,
        );
        ingestor.ingest(&documents, &namespace, false).await?
    };

    if summary.dry_run {
        println!("Dry run (namespace: {}):", namespace);
    } else {
        println!("Ingest complete (namespace: {}):", namespace);
    }
    println!("  documents:        {}", summary.documents);
    println!("  chunks_created:   {}", summary.chunks_created);
    println!("  vectors_upserted: {}", summary.vectors_upserted);
    println!("  skipped:          {}", summary.skipped);
    Ok(())
}

async fn run_ask(cfg: &Config, question: String) -> anyhow::Result<()> {
    let usage = Arc::new(UsageCounters::new());
    let assistant = Assistant::from_config(cfg, usage)?;

    let response = assistant
        .ask(&ChatRequest {
            message: question,
            history: Vec::new(),
        })
        .await?;

    println!("{}", response.answer);
    let sources = render_sources_markdown(&response.sources);
    if !sources.is_empty() {
        println!("\n{}", sources);
    }
    println!("\n(provider: {:?})", response.provider);
    Ok(())
}

async fn run_usage(cfg: &Config, url: Option<String>, reset: bool) -> anyhow::Result<()> {
    let base = url
        .unwrap_or_else(|| format!("http://{}", cfg.server.bind.replace("0.0.0.0", "127.0.0.1")));
    let base = base.trim_end_matches('/');
    let client = reqwest::Client::new();

    if reset {
        let secret = cfg
            .server
            .admin_secret
            .as_deref()
            .context("no admin secret configured (set [server].admin_secret_env)")?;
        let response = client
            .post(format!("{}/usage/reset", base))
            .header(server::ADMIN_SECRET_HEADER, secret)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", base))?;
        if !response.status().is_success() {
            bail!("usage reset failed: HTTP {}", response.status());
        }
        println!("Usage counters reset.");
        return Ok(());
    }

    let snapshot: serde_json::Value = client
        .get(format!("{}/usage", base))
        .send()
        .await
        .with_context(|| format!("Failed to reach {}", base))?
        .error_for_status()?
        .json()
        .await?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
