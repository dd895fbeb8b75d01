//! # docset CLI
//!
//! The `docset` binary creates document sets from search queries, runs the
//! ingestion workers that fill them, clusters them into trees, and serves
//! the JSON API.
//!
//! ## Usage
//!
//! ```bash
//! docset --config ./config/docset.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docset init` | Create the SQLite database and run schema migrations |
//! | `docset create "<query>"` | Create a document set and enqueue its ingestion job |
//! | `docset worker [--once]` | Run ingestion workers |
//! | `docset job <id>` | Show a job's state and item errors |
//! | `docset retry <id>` | Resubmit a failed job |
//! | `docset sets` | List document sets |
//! | `docset delete <id>` | Delete a document set and everything it owns |
//! | `docset tree <set>` | (Re)build a set's cluster tree |
//! | `docset browse <set>` | Page through a set's documents |
//! | `docset nodes <tree>` | Breadth-first listing of a tree's nodes |
//! | `docset tag <doc> "<tags>"` | Replace a document's tags |
//! | `docset serve` | Start the HTTP server |
//!
//! Logging goes to stderr and is controlled with `RUST_LOG`
//! (default `info`).

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use docset::progress::ProgressMode;
use docset::{browse, cluster_cmd, config, ingest, jobs, migrate, server, tag_cmd};
use docset_core::ids::{DocumentId, DocumentSetId, JobId, TreeId};
use docset_core::selection::SelectionFilter;

/// docset — cluster the results of a document search into a browsable tree.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/docset.example.toml` for a full example.
#[derive(Parser)]
#[command(name = "docset", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docset.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it multiple times is safe.
    Init,

    /// Create a document set for a search query and enqueue its ingestion job.
    Create {
        /// Search query sent to the document search service.
        query: String,
    },

    /// Run ingestion workers.
    Worker {
        /// Drain the queue and exit instead of polling forever.
        #[arg(long)]
        once: bool,

        /// Progress output on stderr. Defaults to `human` on a TTY, `off` otherwise.
        #[arg(long, value_enum)]
        progress: Option<ProgressArg>,
    },

    /// Show the state of an ingestion job.
    Job { id: JobId },

    /// Move a failed job back to `submitted`.
    Retry { id: JobId },

    /// List document sets.
    Sets,

    /// Delete a document set with its documents, tags, and tree.
    Delete { id: DocumentSetId },

    /// Cluster a document set and replace its tree.
    Tree { document_set: DocumentSetId },

    /// Page through the documents of a set's tree.
    Browse {
        document_set: DocumentSetId,

        /// Only documents under these nodes (comma-separated ids).
        #[arg(long, value_delimiter = ',')]
        nodes: Vec<docset_core::ids::NodeId>,

        /// Only documents carrying one of these tags (comma-separated ids).
        #[arg(long, value_delimiter = ',')]
        tags: Vec<docset_core::ids::TagId>,

        /// Only these documents (comma-separated ids).
        #[arg(long, value_delimiter = ',')]
        documents: Vec<DocumentId>,

        #[arg(long, default_value_t = 0)]
        offset: usize,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// List a tree's nodes breadth-first.
    Nodes {
        tree: TreeId,

        /// Maximum number of nodes to list; zero or negative lists nothing.
        #[arg(long, default_value_t = 50, allow_negative_numbers = true)]
        max: i64,
    },

    /// Replace the tags of a document with a comma-separated list.
    Tag { document: DocumentId, tags: String },

    /// Start the HTTP server.
    Serve,

    /// Print shell completions.
    Completions { shell: clap_complete::Shell },
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Off,
    Human,
    Json,
}

impl From<ProgressArg> for ProgressMode {
    fn from(arg: ProgressArg) -> Self {
        match arg {
            ProgressArg::Off => ProgressMode::Off,
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Commands that don't require config
    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "docset", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Create { query } => {
            jobs::run_create(&cfg, &query).await?;
        }
        Commands::Worker { once, progress } => {
            let mode = progress
                .map(ProgressMode::from)
                .unwrap_or_else(ProgressMode::default_for_tty);
            ingest::run_worker(&cfg, once, mode).await?;
        }
        Commands::Job { id } => {
            jobs::run_job(&cfg, id).await?;
        }
        Commands::Retry { id } => {
            jobs::run_retry(&cfg, id).await?;
        }
        Commands::Sets => {
            jobs::run_sets(&cfg).await?;
        }
        Commands::Delete { id } => {
            jobs::run_delete(&cfg, id).await?;
        }
        Commands::Tree { document_set } => {
            cluster_cmd::run_tree(&cfg, document_set).await?;
        }
        Commands::Browse {
            document_set,
            nodes,
            tags,
            documents,
            offset,
            limit,
        } => {
            let filter = SelectionFilter {
                nodes,
                documents,
                tags,
            };
            browse::run_browse(&cfg, document_set, filter, offset, limit).await?;
        }
        Commands::Nodes { tree, max } => {
            browse::run_nodes(&cfg, tree, max).await?;
        }
        Commands::Tag { document, tags } => {
            tag_cmd::run_tag(&cfg, document, &tags).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Completions { .. } => {
            // Handled above (before config loading)
            unreachable!()
        }
    }

    Ok(())
}
