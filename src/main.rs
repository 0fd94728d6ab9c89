//! # Intelligent Search CLI (`isearch`)
//!
//! Loads documents into OpenSearch and queries them.
//!
//! ## Usage
//!
//! ```bash
//! isearch [--config ./isearch.toml] <command>
//! ```
//!
//! Every setting can also come from the environment (`OPENSEARCH_ENDPOINT`,
//! `OPENSEARCH_INDEX_NAME`, `DOCUMENT_S3_URI`, ...); see the `config` module.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `isearch ingest` | Load every document under the configured prefix |
//! | `isearch search "<text>"` | Run a keyword, vector or hybrid query |
//! | `isearch serve` | Start the HTTP search API |
//! | `isearch indices` | List user indices |
//! | `isearch delete-index <name>` | Delete an index |
//! | `isearch completions <shell>` | Print shell completions |

use std::path::PathBuf;
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use intelligent_search::config::{self, Config};
use intelligent_search::embedding::{BedrockEmbedder, BedrockEmbedderFactory};
use intelligent_search::index::IndexManager;
use intelligent_search::ingest::{IngestSettings, Ingestor};
use intelligent_search::opensearch::{OpenSearchClient, SearchEngine};
use intelligent_search::search::{SearchRequest, Searcher};
use intelligent_search::server;
use intelligent_search::storage::S3Store;

#[derive(Parser)]
#[command(
    name = "isearch",
    about = "Document ingestion and hybrid search on OpenSearch",
    version
)]
struct Cli {
    /// Path to a TOML configuration file. Environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load documents from object storage into the index.
    ///
    /// Tunes the cluster, installs the search pipelines, creates the index if
    /// needed, then embeds and bulk-loads every document under the prefix.
    Ingest {
        /// Storage prefix (`s3://bucket/prefix/`). Defaults to `documents.uri`.
        #[arg(long)]
        prefix: Option<String>,
    },

    /// Query an index.
    Search {
        text: String,

        /// `keyword`, `vector` or `hybrid`.
        #[arg(long, default_value = "hybrid")]
        method: String,

        /// `chunk` or `document`.
        #[arg(long, default_value = "chunk")]
        unit: String,

        /// Index to query. Defaults to `opensearch.index_name`.
        #[arg(long)]
        index: Option<String>,
    },

    /// Start the HTTP search API on `[server].bind`.
    Serve,

    /// List user indices.
    Indices,

    /// Delete an index. A missing index is not an error.
    DeleteIndex {
        /// Defaults to `opensearch.index_name`.
        name: Option<String>,
    },

    /// Print shell completions.
    Completions {
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "intelligent_search=info,warn".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "isearch", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Ingest { prefix } => run_ingest(&cfg, prefix).await?,
        Commands::Search {
            text,
            method,
            unit,
            index,
        } => run_search(&cfg, text, method, unit, index).await?,
        Commands::Serve => server::run_server(&cfg).await?,
        Commands::Indices => {
            cfg.require_cluster()?;
            let manager = index_manager(&cfg).await?;
            for name in manager.list_indices().await? {
                println!("{}", name);
            }
        }
        Commands::DeleteIndex { name } => {
            let name = match name {
                Some(name) => name,
                None => {
                    cfg.require_index()?;
                    cfg.opensearch.index_name.clone()
                }
            };
            cfg.require_cluster()?;
            let deleted = index_manager(&cfg).await?.delete_index(&name).await?;
            if deleted {
                println!("deleted {}", name);
            } else {
                println!("{} not found (nothing to delete)", name);
            }
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

async fn engine(cfg: &Config) -> anyhow::Result<Arc<dyn SearchEngine>> {
    Ok(Arc::new(OpenSearchClient::from_config(&cfg.opensearch).await?))
}

async fn index_manager(cfg: &Config) -> anyhow::Result<IndexManager> {
    Ok(IndexManager::new(engine(cfg).await?, std::time::Duration::ZERO))
}

async fn run_ingest(cfg: &Config, prefix: Option<String>) -> anyhow::Result<()> {
    cfg.require_index()?;
    let prefix = match prefix {
        Some(prefix) => prefix,
        None => {
            cfg.require_documents()?;
            cfg.documents.uri.clone()
        }
    };

    let ingestor = Ingestor::new(
        Arc::new(S3Store::from_config(&cfg.documents).await?),
        Arc::new(BedrockEmbedder::from_config(&cfg.embedding).await?),
        engine(cfg).await?,
        IngestSettings::from_config(cfg),
    );
    let report = ingestor.run(&prefix).await?;

    println!("ingest {}", prefix);
    let state = if report.index_created {
        "created"
    } else {
        "existing"
    };
    println!("  index: {} ({})", cfg.opensearch.index_name, state);
    println!("  documents: {}", report.documents);
    println!("  skipped: {}", report.skipped.len());
    for locator in &report.skipped {
        println!("    {}", locator.uri);
    }
    println!("  records written: {}", report.records);
    println!("  bulk batches: {}", report.batches);
    println!("ok");
    Ok(())
}

async fn run_search(
    cfg: &Config,
    text: String,
    method: String,
    unit: String,
    index: Option<String>,
) -> anyhow::Result<()> {
    cfg.require_cluster()?;
    let index_name = match index {
        Some(index) => index,
        None => {
            cfg.require_index()?;
            cfg.opensearch.index_name.clone()
        }
    };

    let searcher = Searcher::new(
        engine(cfg).await?,
        Arc::new(BedrockEmbedderFactory::from_config(&cfg.embedding).await?),
    );
    let hits = searcher
        .search(&SearchRequest {
            index_name,
            text,
            search_method: method,
            search_result_unit: unit,
        })
        .await?;

    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, hit) in hits.iter().enumerate() {
        println!(
            "{}. [{:.4}] {}/{} ({})",
            i + 1,
            hit.score,
            hit.docs_root,
            hit.doc_name,
            hit.service
        );
        println!("   {}", hit.text.trim());
    }
    Ok(())
}
