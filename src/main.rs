//! # distill CLI
//!
//! Fetches a long document, summarizes it with a map-reduce pass over
//! token-bounded chunks, and delivers the summary in transport-sized
//! segments.
//!
//! ## Usage
//!
//! ```bash
//! distill --config ./config/distill.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `distill run <url>` | Fetch, summarize, save and print (or `--deliver` to Discord) |
//! | `distill fetch <url>` | Fetch and cache a document, print its normalized text |
//! | `distill plan <url>` / `--file <path>` | Show chunking and token statistics |
//! | `distill segment --file <path>` | Split a text file into message segments |
//!
//! Logging goes to stderr and is controlled by `RUST_LOG`
//! (default `distill=info`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use distill::backend::create_backend;
use distill::config::{self, Config};
use distill::delivery::{create_delivery, Delivery, StdoutDelivery};
use distill::fetch::ResilientFetcher;
use distill::pipeline::{self, RunOptions};
use distill::progress::ProgressMode;
use distill_core::models::Document;
use distill_core::segment::segment;

/// distill: token-aware map-reduce summarization of long documents.
#[derive(Parser)]
#[command(
    name = "distill",
    about = "Fetch a long document, summarize it under a token budget, deliver it in segments",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/distill.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch a URL, summarize it and deliver the summary.
    ///
    /// Without `--deliver` the summary is printed to stdout. With it, the
    /// segments are posted to every configured Discord channel using the
    /// token in `DISCORD_BOT_TOKEN`.
    Run {
        url: String,
        /// Post to Discord instead of printing.
        #[arg(long)]
        deliver: bool,
        /// Do not write the summary under `output.dir`.
        #[arg(long)]
        no_save: bool,
        /// Progress on stderr: human, json or off. Defaults to human on a
        /// TTY and off otherwise.
        #[arg(long, value_enum)]
        progress: Option<ProgressArg>,
        /// Cancel the run after this many seconds.
        #[arg(long)]
        deadline_secs: Option<u64>,
    },

    /// Fetch a URL (with retries), cache it and print the normalized text.
    Fetch { url: String },

    /// Show how a document would be chunked, without calling a model.
    Plan {
        /// URL to fetch.
        url: Option<String>,
        /// Read a local text file instead.
        #[arg(long, conflicts_with = "url")]
        file: Option<PathBuf>,
        /// Print the plan as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Split a text file into message segments and print them.
    Segment {
        #[arg(long)]
        file: PathBuf,
        /// Override `delivery.max_chars_per_segment`.
        #[arg(long)]
        max_chars: Option<usize>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Human,
    Json,
    Off,
}

impl From<ProgressArg> for ProgressMode {
    fn from(arg: ProgressArg) -> Self {
        match arg {
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
            ProgressArg::Off => ProgressMode::Off,
        }
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("distill=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn read_document(path: &Path) -> Result<Document> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(Document::from_text(path.display().to_string(), text))
}

/// Cancel the token on Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling");
            token.cancel();
        }
    });
    cancel
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    // Commands that work on local files run with defaults when there is no
    // config file.
    let local_only = matches!(
        cli.command,
        Commands::Segment { .. } | Commands::Plan { file: Some(_), .. }
    );
    let cfg = if local_only {
        config::load_or_default(&cli.config)?
    } else {
        config::load_config(&cli.config)?
    };
    let cancel = cancel_on_ctrl_c();

    match cli.command {
        Commands::Run {
            url,
            deliver,
            no_save,
            progress,
            deadline_secs,
        } => {
            let backend = create_backend(&cfg.backend)?;
            let delivery = create_delivery(&cfg.delivery, deliver)?;
            let mode = progress
                .map(ProgressMode::from)
                .unwrap_or_else(ProgressMode::default_for_tty);
            let reporter = mode.reporter();
            let options = RunOptions {
                save: !no_save,
                deadline: deadline_secs.map(Duration::from_secs),
            };
            let report = pipeline::run_url(
                &cfg,
                &url,
                backend.as_ref(),
                delivery.as_ref(),
                reporter.as_ref(),
                &options,
                &cancel,
            )
            .await?;

            if report.summary.partial {
                eprintln!(
                    "warning: summary is partial, chunks {:?} failed",
                    report.summary.failed_chunks
                );
            }
            if let Some(path) = &report.saved_to {
                eprintln!("saved {}", path.display());
            }
        }
        Commands::Fetch { url } => {
            let fetcher = ResilientFetcher::new(&cfg.fetch)?;
            let doc = fetcher.fetch(&url, &cancel).await?;
            if let Some(key) = &doc.cache_key {
                eprintln!("cached as {}", key);
            }
            println!("{}", doc.text);
        }
        Commands::Plan {
            file: Some(path),
            json,
            ..
        } => {
            let doc = read_document(&path)?;
            print_plan(&cfg, &doc, json)?;
        }
        Commands::Plan { url: Some(url), json, .. } => {
            let fetcher = ResilientFetcher::new(&cfg.fetch)?;
            let doc = fetcher.fetch(&url, &cancel).await?;
            print_plan(&cfg, &doc, json)?;
        }
        Commands::Plan { .. } => bail!("plan needs a URL or --file"),
        Commands::Segment { file, max_chars } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let max = max_chars.unwrap_or(cfg.delivery.max_chars_per_segment);
            if max == 0 {
                bail!("--max-chars must be > 0");
            }
            let segments = segment(&text, max);
            StdoutDelivery.deliver(&segments, &cancel).await?;
        }
    }

    Ok(())
}

fn print_plan(cfg: &Config, doc: &Document, json: bool) -> Result<()> {
    let plan = pipeline::plan_document(cfg, doc)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    println!("Document: {}", doc.url);
    println!("  characters:   {}", plan.stats.char_count);
    println!("  words:        {}", plan.stats.word_count);
    println!(
        "  tokens:       ~{} (limit {} per chunk)",
        plan.stats.estimated_tokens, plan.stats.max_tokens
    );
    println!("  approach:     {}", plan.stats.recommendation);
    println!("  chunks:       {}", plan.chunk_count);
    println!("  avg chunk:    ~{} tokens", plan.avg_chunk_tokens);
    println!("  concurrency:  {}", plan.recommended_concurrency);
    for (i, tokens) in plan.chunk_tokens.iter().enumerate() {
        println!("    chunk {:>3}: ~{} tokens", i, tokens);
    }
    Ok(())
}
