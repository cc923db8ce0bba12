//! # readme-atlas CLI (`atlas`)
//!
//! Commands for the two halves of the ingestion pipeline plus index
//! bootstrap and health checks.
//!
//! | Command | Description |
//! |---------|-------------|
//! | `atlas fetch` | Crawl READMEs for archived origins onto disk |
//! | `atlas ingest` | Embed fetched READMEs and upsert into Qdrant |
//! | `atlas init` | Create the Qdrant collection and payload index |
//! | `atlas stats` | Show fetch/ingest/index counts |
//!
//! ## Examples
//!
//! ```bash
//! # Crawl the 6k sample archive
//! atlas fetch --limit 6000 --proxies proxies.txt
//!
//! # Crawl a slice of the full archive in a sibling process
//! atlas fetch --full --offset 2000000 --limit 1000000
//!
//! # Embed in realtime with 2 rotating API keys
//! atlas ingest --provider nebius --keys 2
//!
//! # Embed through the asynchronous batch API
//! atlas ingest --provider nebius-batch --chunk 25000 --parallel 3
//! ```
//!
//! Exit codes: `0` on completion *or* when the embedding budget runs out
//! (state is preserved for the next run); `1` on any other error.

use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use readme_atlas::config::Config;
use readme_atlas::embedding::Provider;
use readme_atlas::models::is_budget_exhausted;
use readme_atlas::origins::WorkParams;
use readme_atlas::store::qdrant::QdrantStore;
use readme_atlas::store::VectorStore;
use readme_atlas::{fetch, ingest, stats};

/// readme-atlas — semantic-search indexing over GitHub repository READMEs.
#[derive(Parser)]
#[command(
    name = "atlas",
    about = "Builds and maintains a semantic-search index over GitHub repository READMEs",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch READMEs for archived origins onto disk.
    ///
    /// Streams origin URLs from the parquet archive, resolves each
    /// repo's README across branch and filename candidates, and records
    /// every outcome durably (artifact or error marker). Safe to restart
    /// and to run as parallel instances over disjoint offset slices.
    Fetch {
        /// Maximum number of origins to process.
        #[arg(long)]
        limit: Option<usize>,

        /// Row offset to start from. Offsets above zero run as a
        /// parallel instance with per-fetch filesystem skip checks.
        #[arg(long, default_value_t = 0)]
        offset: usize,

        /// Use the full archive snapshot instead of the 6k sample.
        #[arg(long)]
        full: bool,

        /// Only fetch origins last visited on or after this date (YYYY-MM-DD).
        #[arg(long)]
        min_date: Option<String>,

        /// Path to a proxy list file (host:port or host:port:user:pass
        /// per line). Repeatable.
        #[arg(long)]
        proxies: Vec<PathBuf>,

        /// Log per-repo errors and warnings.
        #[arg(long)]
        verbose: bool,
    },

    /// Embed fetched READMEs and upsert vectors into the store.
    ///
    /// De-duplicates by content hash, skips everything already indexed,
    /// and drives either the realtime worker pool or the asynchronous
    /// batch pipeline depending on the provider.
    Ingest {
        /// Embedding provider: deepinfra, nebius, or nebius-batch.
        #[arg(long, default_value = "nebius")]
        provider: String,

        /// Number of API keys to rotate through
        /// (`<PROVIDER>_API_KEY`, `<PROVIDER>_API_KEY_1`, …).
        #[arg(long, default_value_t = 1)]
        keys: usize,

        /// Items per async batch job.
        #[arg(long)]
        chunk: Option<usize>,

        /// Concurrently processed batch chunks.
        #[arg(long)]
        parallel: Option<usize>,
    },

    /// Create the vector collection and payload index if absent.
    Init,

    /// Show fetch, error-marker, batch-state, and index counts.
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env()?;

    let result = match cli.command {
        Commands::Fetch {
            limit,
            offset,
            full,
            min_date,
            proxies,
            verbose,
        } => {
            let min_date = min_date
                .map(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d"))
                .transpose()?;
            let params = WorkParams {
                limit,
                offset,
                full,
                min_date,
            };
            fetch::run_fetch(&config, &params, &proxies, verbose).await
        }
        Commands::Ingest {
            provider,
            keys,
            chunk,
            parallel,
        } => {
            config.embed.provider = Provider::parse(&provider)?;
            config.embed.keys = keys;
            if let Some(chunk) = chunk {
                config.embed.chunk_size = chunk;
            }
            if let Some(parallel) = parallel {
                config.embed.parallel = parallel;
            }
            config.validate()?;
            ingest::run_ingest(&config).await
        }
        Commands::Init => {
            let store = QdrantStore::new(
                &config.qdrant_url,
                &config.collection,
                config.embed.dims,
            )?;
            store.ensure_collection().await?;
            println!("Collection '{}' ready.", config.collection);
            Ok(())
        }
        Commands::Stats => stats::run_stats(&config).await,
    };

    // Budget exhaustion is a graceful stop, not a failure: durable state
    // is already on disk and in the store, so the next run continues.
    if let Err(e) = result {
        if is_budget_exhausted(&e) {
            println!("{:#}", e);
            println!("State preserved; rerun to continue.");
            return Ok(());
        }
        return Err(e);
    }
    Ok(())
}
