//! Configuration for the fetch and ingest pipelines.
//!
//! Settings are assembled from environment variables with defaults, then
//! overridden by CLI flags where the commands expose them. See the table
//! in the crate docs for the full list.
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `DATA_DIR` | `./data` | Root for archives, batch state, and READMEs |
//! | `READMES_DIR` | `<DATA_DIR>/readmes` | README artifacts + error markers |
//! | `QDRANT_URL` | `http://localhost:6333` | Vector store endpoint |
//! | `<PROVIDER>_API_KEY[_i]` | — | Embedding API keys (round-robin) |

use anyhow::{bail, Result};
use std::path::PathBuf;

use crate::embedding::Provider;

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub readmes_dir: PathBuf,
    pub qdrant_url: String,
    pub collection: String,
    pub fetch: FetchConfig,
    pub embed: EmbedConfig,
}

/// Knobs for the fetch engine.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Maximum in-flight fetch tasks.
    pub concurrency: usize,
    /// Attempts per HTTP request (fresh proxy each attempt).
    pub max_retries: u32,
    /// Branch candidates, searched in order. `master` first: it covers
    /// roughly 70% of archived repos.
    pub branches: Vec<String>,
    /// READMEs below this many bytes get a `tooSmall` marker.
    pub min_size: usize,
    /// Content is truncated to this many chars before writing.
    pub max_chars: usize,
    pub timeout_secs: u64,
}

/// Knobs for the embed drivers.
#[derive(Debug, Clone)]
pub struct EmbedConfig {
    pub provider: Provider,
    /// Number of API keys to rotate through.
    pub keys: usize,
    /// Embedding dimension; fixed at collection creation.
    pub dims: usize,
    /// Item-count cap per realtime request.
    pub batch_size: usize,
    /// Char-budget cap per realtime request; whichever fires first wins.
    pub max_batch_chars: usize,
    /// Realtime worker tasks.
    pub workers: usize,
    /// Items per async batch job.
    pub chunk_size: usize,
    /// Concurrently processed batch chunks.
    pub parallel: usize,
    pub poll_interval_secs: u64,
    /// Content is truncated to this many chars before embedding.
    pub max_content_len: usize,
    /// Concurrent README file reads in the item loader.
    pub file_readers: usize,
    /// Dollars per million tokens, for the pre-chunk cost estimate.
    pub price_per_mtok: f64,
}

fn default_concurrency() -> usize {
    1000
}
fn default_max_retries() -> u32 {
    3
}
fn default_min_size() -> usize {
    500
}
fn default_max_chars() -> usize {
    50_000
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_batch_size() -> usize {
    64
}
fn default_max_batch_chars() -> usize {
    120_000
}
fn default_workers() -> usize {
    48
}
fn default_chunk_size() -> usize {
    25_000
}
fn default_parallel() -> usize {
    3
}
fn default_poll_interval_secs() -> u64 {
    30
}
fn default_max_content_len() -> usize {
    16_000
}
fn default_file_readers() -> usize {
    16
}
fn default_price_per_mtok() -> f64 {
    0.01
}

impl Config {
    /// Build a config from the environment with all defaults applied.
    pub fn from_env() -> Result<Self> {
        let data_dir = PathBuf::from(env_or("DATA_DIR", "./data"));
        let readmes_dir = std::env::var("READMES_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("readmes"));

        let mut config = Self::for_dirs(data_dir, readmes_dir);
        config.qdrant_url = env_or("QDRANT_URL", "http://localhost:6333");
        config.collection = env_or("QDRANT_COLLECTION", "readmes");
        config.validate()?;
        Ok(config)
    }

    /// All-defaults config rooted at the given directories.
    pub fn for_dirs(data_dir: PathBuf, readmes_dir: PathBuf) -> Self {
        Self {
            data_dir,
            readmes_dir,
            qdrant_url: "http://localhost:6333".to_string(),
            collection: "readmes".to_string(),
            fetch: FetchConfig {
                concurrency: default_concurrency(),
                max_retries: default_max_retries(),
                branches: vec!["master".to_string(), "main".to_string()],
                min_size: default_min_size(),
                max_chars: default_max_chars(),
                timeout_secs: default_timeout_secs(),
            },
            embed: EmbedConfig {
                provider: Provider::Nebius,
                keys: 1,
                dims: 4096,
                batch_size: default_batch_size(),
                max_batch_chars: default_max_batch_chars(),
                workers: default_workers(),
                chunk_size: default_chunk_size(),
                parallel: default_parallel(),
                poll_interval_secs: default_poll_interval_secs(),
                max_content_len: default_max_content_len(),
                file_readers: default_file_readers(),
                price_per_mtok: default_price_per_mtok(),
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.fetch.concurrency == 0 {
            bail!("fetch concurrency must be > 0");
        }
        if self.fetch.branches.is_empty() {
            bail!("at least one branch candidate is required");
        }
        if self.embed.dims != 4096 && self.embed.dims != 1536 {
            bail!(
                "unsupported embedding dimension {} (expected 4096 or 1536)",
                self.embed.dims
            );
        }
        if self.embed.keys == 0 {
            bail!("at least one API key slot is required");
        }
        if self.embed.chunk_size == 0 || self.embed.parallel == 0 {
            bail!("batch chunk size and parallelism must be > 0");
        }
        Ok(())
    }

    /// Directory holding the per-status error marker buckets.
    pub fn errors_dir(&self) -> PathBuf {
        self.readmes_dir.join(".errors")
    }

    /// Embedded database holding the work table and fetch cursors.
    pub fn fetch_cache_path(&self) -> PathBuf {
        self.readmes_dir.join(".fetch-cache.duckdb")
    }

    /// Durable mapping of in-flight batch IDs to item metadata.
    pub fn batch_state_path(&self) -> PathBuf {
        self.data_dir.join("batch-state.json")
    }

    /// Parquet archive of origin URLs (6k sample or full snapshot).
    pub fn origins_parquet(&self, full: bool) -> PathBuf {
        let name = if full {
            "github_origins_full.parquet"
        } else {
            "github_origins_6k.parquet"
        };
        self.data_dir.join(name)
    }

    /// Parquet archive of origin visit dates, for `--min-date` filtering.
    pub fn visits_parquet(&self, full: bool) -> PathBuf {
        let name = if full {
            "github_visits_full.parquet"
        } else {
            "github_visits_6k.parquet"
        };
        self.data_dir.join(name)
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config::for_dirs(
            PathBuf::from("/tmp/atlas"),
            PathBuf::from("/tmp/atlas/readmes"),
        )
    }

    #[test]
    fn validates_dims() {
        let mut cfg = base();
        cfg.embed.dims = 1536;
        assert!(cfg.validate().is_ok());
        cfg.embed.dims = 768;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validates_concurrency_and_keys() {
        let mut cfg = base();
        cfg.fetch.concurrency = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = base();
        cfg.embed.keys = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn derived_paths() {
        let cfg = base();
        assert!(cfg.errors_dir().ends_with("readmes/.errors"));
        assert!(cfg.fetch_cache_path().ends_with(".fetch-cache.duckdb"));
        assert!(cfg.batch_state_path().ends_with("batch-state.json"));
        assert!(cfg
            .origins_parquet(true)
            .ends_with("github_origins_full.parquet"));
        assert!(cfg
            .visits_parquet(false)
            .ends_with("github_visits_6k.parquet"));
    }
}
