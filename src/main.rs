//! # Annotation Harness CLI (`anno`)
//!
//! The `anno` binary initializes the SQLite index and runs the HTTP API
//! server.
//!
//! ## Usage
//!
//! ```bash
//! anno --config ./config/anno.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `anno init` | Create the SQLite index and run schema migrations |
//! | `anno serve` | Start the HTTP API server |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the index
//! anno init --config ./config/anno.toml
//!
//! # Start the API server
//! anno serve --config ./config/anno.toml
//!
//! # Ingest a batch
//! curl -X POST localhost:6900/api/datasets/TextClassification/reviews/bulk \
//!      -H 'content-type: application/json' \
//!      -d '{"records": [{"id": "r1", "task": "TextClassification", "text": "great"}]}'
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use annotation_harness::{config, migrate, server};

/// Annotation Harness CLI — the record-management core of a data-annotation
/// platform.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/anno.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "anno",
    about = "Annotation Harness — dataset ingestion, search, streaming export, and labeling-rule metrics",
    version,
    long_about = "Annotation Harness ingests batches of annotated/predicted records into named \
    datasets backed by a search index, answers structured search queries, streams results as \
    NDJSON, and computes weak-supervision metrics for labeling rules."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/anno.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the index schema.
    ///
    /// Creates the SQLite database file and all required tables (datasets,
    /// records, record_labels, records_fts). This command is idempotent —
    /// running it multiple times is safe.
    Init,

    /// Start the HTTP API server.
    ///
    /// Binds to the address configured in `[server].bind` and serves the
    /// dataset, search, export, and labeling-rule endpoints. Requires the
    /// index to have been initialized with `anno init`.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Index initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
