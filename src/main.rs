//! # Project Matcher CLI (`pmatch`)
//!
//! ## Usage
//!
//! ```bash
//! pmatch --config ./config/pmatch.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `pmatch init` | Create the SQLite database and run schema migrations |
//! | `pmatch store save <file>` | Store a source file by content hash |
//! | `pmatch store path <id>` | Print the on-disk path of a stored file |
//! | `pmatch store delete <id>` | Remove a stored record (bytes stay until sweep) |
//! | `pmatch store sweep` | Delete stored files no record refers to |
//! | `pmatch normalize <raw.json>` | Validate, dedup and print a project list |
//! | `pmatch match ...` | Rank projects against a candidate profile |
//! | `pmatch cache stats` | Show cache and history counts |
//! | `pmatch cache clear` | Empty match cache, history and project lists |
//!
//! Logs go to stderr (`RUST_LOG` controls the level); command output goes
//! to stdout.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing_subscriber::EnvFilter;

use project_matcher::commands::{self, MatchArgs};
use project_matcher::config;
use project_matcher::migrate;
use project_matcher::models::DocumentKind;

/// Project Matcher: hybrid embedding + LLM ranking of opportunity
/// listings against a candidate profile.
#[derive(Parser)]
#[command(
    name = "pmatch",
    about = "Hybrid embedding + LLM matching of project listings against a candidate profile",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/pmatch.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Content-addressed file storage.
    Store {
        #[command(subcommand)]
        action: StoreAction,
    },

    /// Normalize a raw project list and print it as JSON.
    Normalize {
        /// JSON array of projects, or an object with a `projects` array.
        file: PathBuf,

        /// Re-run normalization even if this file was seen before.
        #[arg(long)]
        no_cache: bool,
    },

    /// Rank projects against a candidate profile.
    Match {
        /// Candidate profile JSON.
        #[arg(long)]
        candidate: PathBuf,

        /// Raw project list JSON.
        #[arg(long)]
        projects: PathBuf,

        /// Drop results scoring below this (0-100).
        #[arg(long)]
        min_score: Option<u8>,

        /// Score every project instead of prefiltering by similarity.
        #[arg(long)]
        no_hybrid: bool,

        /// Maximum projects kept by the prefilter.
        #[arg(long)]
        top_k: Option<usize>,

        /// Print the full report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Inspect or clear cached results.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum StoreAction {
    Save {
        file: PathBuf,
        /// cv, project_book, or other.
        #[arg(long, default_value = "other")]
        kind: DocumentKind,
    },
    Path {
        id: i64,
    },
    Delete {
        id: i64,
    },
    Sweep,
}

#[derive(Subcommand)]
enum CacheAction {
    Stats,
    Clear,
}

#[tokio::main]
async fn main() {
    init_tracing();

    if let Err(err) = run().await {
        error!(error = %err, "command failed");
        for cause in err.chain().skip(1) {
            error!(cause = %cause, "caused by");
        }
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Store { action } => match action {
            StoreAction::Save { file, kind } => {
                commands::run_store_save(&cfg, &file, kind).await?;
            }
            StoreAction::Path { id } => {
                commands::run_store_path(&cfg, id).await?;
            }
            StoreAction::Delete { id } => {
                commands::run_store_delete(&cfg, id).await?;
            }
            StoreAction::Sweep => {
                commands::run_store_sweep(&cfg).await?;
            }
        },
        Commands::Normalize { file, no_cache } => {
            commands::run_normalize(&cfg, &file, no_cache).await?;
        }
        Commands::Match {
            candidate,
            projects,
            min_score,
            no_hybrid,
            top_k,
            json,
        } => {
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received, finishing current project");
                    on_signal.cancel();
                }
            });

            let args = MatchArgs {
                candidate: &candidate,
                projects: &projects,
                min_score,
                no_hybrid,
                top_k,
                json,
            };
            commands::run_match(&cfg, args, cancel).await?;
        }
        Commands::Cache { action } => match action {
            CacheAction::Stats => {
                commands::run_cache_stats(&cfg).await?;
            }
            CacheAction::Clear => {
                commands::run_cache_clear(&cfg).await?;
            }
        },
    }

    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
