//! # docqa CLI
//!
//! Runs the backend and drives it from the command line.
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
//! | `docqa init` | Create the backend and cache databases |
//! | `docqa serve` | Start the backend HTTP server |
//! | `docqa load <id> <path>` | Make a document queryable through the load cache |
//! | `docqa ask <id> "<query>"` | Stream a cited answer (Ctrl-C cancels) |
//! | `docqa search <id> "<query>"` | Show retrieval and budget diagnostics |
//! | `docqa cache list` | List cache entries |
//! | `docqa cache reset <id>` | Forget a cache entry so the next load retries |
//! | `docqa cache sweep` | Evict expired cache entries |
//!
//! Set `RUST_LOG` to adjust log output (default `docqa=info`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use docqa::{commands, config, migrate, server};

/// docqa: cited question answering over long documents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/docqa.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "docqa",
    about = "Cited question answering over long documents",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docqa.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the backend and cache databases. Safe to run repeatedly.
    Init,

    /// Start the backend HTTP server on `[server].bind`.
    Serve,

    /// Make a document queryable through the load cache.
    ///
    /// Uploads only when the backend does not already have the document.
    Load {
        /// Upstream document id.
        document_id: String,
        /// PDF or text file to upload if needed.
        path: PathBuf,
        /// Display name (defaults to the file name).
        #[arg(long)]
        name: Option<String>,
    },

    /// Ask a question and stream the cited answer.
    Ask {
        /// Upstream document id or backend handle.
        document_id: String,
        query: String,
        /// Load this file through the cache first.
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Show how a query is planned, retrieved, and budgeted.
    ///
    /// Reads the local backend database directly; no server needed.
    Search {
        /// Upstream document id or backend handle.
        document_id: String,
        query: String,
    },

    /// Inspect and manage the load cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// List unexpired entries.
    List,
    /// Forget an entry (cancelling its load) so the next load starts over.
    Reset { document_id: String },
    /// Evict entries older than the TTL.
    Sweep,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("docqa=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Databases initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Load {
            document_id,
            path,
            name,
        } => {
            commands::run_load(&cfg, &document_id, &path, name).await?;
        }
        Commands::Ask {
            document_id,
            query,
            file,
        } => {
            commands::run_ask(&cfg, &document_id, &query, file.as_deref()).await?;
        }
        Commands::Search { document_id, query } => {
            commands::run_search(&cfg, &document_id, &query).await?;
        }
        Commands::Cache { action } => match action {
            CacheAction::List => commands::run_cache_list(&cfg).await?,
            CacheAction::Reset { document_id } => {
                commands::run_cache_reset(&cfg, &document_id).await?
            }
            CacheAction::Sweep => commands::run_cache_sweep(&cfg).await?,
        },
    }

    Ok(())
}
