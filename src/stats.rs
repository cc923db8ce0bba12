//! Index health overview.
//!
//! Quick counts of what the pipeline has produced so far: README
//! artifacts on disk, error markers per bucket, in-flight batches, and
//! points in the vector store. Used by `atlas stats` to confirm fetch
//! and ingest runs are landing where expected.

use anyhow::Result;

use crate::batch_state::BatchStateStore;
use crate::config::Config;
use crate::store::qdrant::QdrantStore;
use crate::store::VectorStore;

pub async fn run_stats(config: &Config) -> Result<()> {
    let readme_count = count_files(&config.readmes_dir);

    println!("readme-atlas — Index Stats");
    println!("==========================");
    println!();
    println!("  READMEs dir:    {}", config.readmes_dir.display());
    println!("  READMEs:        {}", readme_count);

    let errors_dir = config.errors_dir();
    if errors_dir.exists() {
        let mut buckets: Vec<(String, usize)> = Vec::new();
        for bucket in std::fs::read_dir(&errors_dir)?.flatten() {
            if bucket.file_type()?.is_dir() {
                let name = bucket.file_name().to_string_lossy().into_owned();
                buckets.push((name, count_files(&bucket.path())));
            }
        }
        buckets.sort_by(|a, b| b.1.cmp(&a.1));
        let total: usize = buckets.iter().map(|(_, n)| n).sum();
        println!("  Error markers:  {}", total);
        for (bucket, count) in buckets {
            println!("    {:12} {}", bucket, count);
        }
    }

    if config.batch_state_path().exists() {
        let state = BatchStateStore::load(&config.batch_state_path())?;
        println!("  Batches in state: {}", state.len());
    }

    let store = QdrantStore::new(&config.qdrant_url, &config.collection, config.embed.dims)?;
    match store.count().await {
        Ok(count) => println!("  Vector points:  {}", count),
        Err(e) => println!("  Vector points:  unavailable ({})", e),
    }

    Ok(())
}

fn count_files(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .filter(|e| {
                    e.file_type().map(|t| t.is_file()).unwrap_or(false)
                        && !e.file_name().to_string_lossy().starts_with('.')
                })
                .count()
        })
        .unwrap_or(0)
}
