//! # Transcript Shipper CLI (`tship`)
//!
//! ## Usage
//!
//! ```bash
//! tship --config ./config/tship.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `tship run` | Run one ingestion cycle |
//! | `tship schedule` | Run a cycle now and then every `poll_interval_secs` |
//! | `tship watch` | Run a cycle whenever the capture tree changes |
//! | `tship status` | Show committed/pending counts and sink reachability |
//! | `tship reset --yes` | Forget every committed file |
//! | `tship search <user>` | Newest indexed conversations for a user |
//!
//! ## Exit codes
//!
//! `0` when the cycle completed (bad captures included), `2` when the cycle
//! aborted (sink unreachable, progress store unwritable, source root
//! missing), `1` for configuration and usage errors.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use transcript_shipper::config::{self, Config};
use transcript_shipper::driver;
use transcript_shipper::pipeline::{CycleSummary, Pipeline};
use transcript_shipper::report::ProgressMode;
use transcript_shipper::sink::ElasticsearchSink;
use transcript_shipper::store::open_store;

/// Transcript Shipper: ships captured chat transcripts into Elasticsearch.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/tship.example.toml` for a full example.
#[derive(Parser)]
#[command(name = "tship", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/tship.toml")]
    config: PathBuf,

    /// Progress output on stderr.
    #[arg(long, global = true, value_enum, default_value = "auto")]
    progress: ProgressMode,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one ingestion cycle and exit.
    Run,

    /// Run a cycle immediately, then every `pipeline.poll_interval_secs`.
    ///
    /// Stops on Ctrl-C or SIGTERM after the batch in flight is committed.
    Schedule,

    /// Run a cycle whenever files under the source root change.
    ///
    /// The tree is polled every `pipeline.watch_debounce_ms`; a full cycle
    /// also runs every `pipeline.poll_interval_secs` as a fallback.
    Watch,

    /// Show source, progress store, and sink status.
    Status,

    /// Forget every committed file so the next cycle ships everything again.
    Reset {
        /// Confirm the reset.
        #[arg(long)]
        yes: bool,
    },

    /// Show the newest indexed conversations for a user.
    Search {
        user_id: String,

        /// Maximum number of conversations to return.
        #[arg(long, default_value_t = 10)]
        size: usize,
    },
}

fn init_tracing(cfg: &Config) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log.level)))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            // Usage errors share exit code 1 with config errors; 2 means a cycle aborted.
            return Ok(match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(1),
            });
        }
    };
    let cfg = config::load_config(&cli.config)?;
    init_tracing(&cfg);

    match cli.command {
        Commands::Run => {
            let pipeline = Arc::new(Pipeline::from_config(&cfg).await?.with_reporter(cli.progress.reporter()));
            tokio::spawn(driver::shutdown_signal(Arc::clone(&pipeline)));

            match driver::run_once(&pipeline).await {
                Ok(summary) => {
                    print_summary(&summary);
                    return Ok(ExitCode::SUCCESS);
                }
                Err(e) => {
                    print_summary(&e.summary());
                    eprintln!("Error: {}", e);
                    return Ok(ExitCode::from(2));
                }
            }
        }
        Commands::Schedule => {
            let pipeline = Arc::new(Pipeline::from_config(&cfg).await?.with_reporter(cli.progress.reporter()));
            tokio::spawn(driver::shutdown_signal(Arc::clone(&pipeline)));
            driver::run_interval(
                &pipeline,
                Duration::from_secs(cfg.pipeline.poll_interval_secs),
            )
            .await?;
        }
        Commands::Watch => {
            let pipeline = Arc::new(Pipeline::from_config(&cfg).await?.with_reporter(cli.progress.reporter()));
            tokio::spawn(driver::shutdown_signal(Arc::clone(&pipeline)));
            driver::run_watch(
                pipeline,
                Duration::from_millis(cfg.pipeline.watch_debounce_ms),
                Duration::from_secs(cfg.pipeline.poll_interval_secs),
            )
            .await?;
        }
        Commands::Status => {
            run_status(&cfg).await?;
        }
        Commands::Reset { yes } => {
            if !yes {
                bail!("Refusing to reset the progress store without --yes");
            }
            let store = open_store(&cfg.progress).await?;
            let before = store.count().await?;
            store.reset().await?;
            println!("Progress store reset ({} records removed).", before);
        }
        Commands::Search { user_id, size } => {
            let sink = ElasticsearchSink::new(&cfg.sink)?;
            let hits = sink.search_by_user(&user_id, size).await?;
            if hits.is_empty() {
                println!("No conversations found for user '{}'.", user_id);
            }
            for hit in hits {
                let turns = hit
                    .get("conversation")
                    .and_then(|c| c.as_array())
                    .map_or(0, |c| c.len());
                println!(
                    "{}  {}  ({} turns)",
                    hit.get("timestamp").and_then(|v| v.as_str()).unwrap_or("-"),
                    hit.get("file_name").and_then(|v| v.as_str()).unwrap_or("-"),
                    turns
                );
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn print_summary(summary: &CycleSummary) {
    println!("cycle");
    println!("  files discovered: {}", summary.files_discovered);
    println!("  documents committed: {}", summary.documents_committed);
    println!("  files failed: {}", summary.files_failed);
    if summary.documents_rejected > 0 {
        println!("  documents rejected: {}", summary.documents_rejected);
    }
}

async fn run_status(cfg: &Config) -> Result<()> {
    let pipeline = Pipeline::from_config(cfg).await?;
    let committed = pipeline.store().count().await?;
    let pending = match pipeline.discovery().scan(pipeline.store().as_ref(), None).await {
        Ok(files) => files.len().to_string(),
        Err(e) => format!("unavailable ({:#})", e),
    };
    let sink = match pipeline.sink().ping().await {
        Ok(()) => "OK".to_string(),
        Err(e) => format!("FAIL ({})", e),
    };

    println!("source: {}", cfg.source.root.display());
    println!(
        "progress: {} ({})",
        pipeline.store().backend(),
        cfg.progress.path.display()
    );
    println!("  committed: {}", committed);
    println!("  pending: {}", pending);
    println!("sink: {} {}  {}", pipeline.sink().name(), cfg.sink.url, sink);
    Ok(())
}
