//! Ingestion orchestrator: README files on disk → vectors in the store.
//!
//! Drives a file-level outer loop whose chunk size is
//! `chunk_size × parallel × 2` — large enough to keep every batch worker
//! saturated, small enough to bound RAM (the corpus is hundreds of GB;
//! only one outer chunk of content is ever resident). Per outer chunk:
//! load items, estimate cost, dispatch to the realtime or batch driver,
//! then fold the chunk's IDs into the in-memory existing-ID set so later
//! chunks skip them without re-scanning the vector store.
//!
//! The vector store is the source of truth for "already embedded"; the
//! batch resume protocol runs before any new submission, and its
//! in-flight IDs join the exclusion set. `BudgetExhausted` propagates to
//! the caller, which turns it into a clean exit.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::batch::{BatchDriver, HttpBatchEndpoint};
use crate::batch_state::BatchStateStore;
use crate::buffer::AsyncBuffer;
use crate::config::Config;
use crate::embedding::KeyRing;
use crate::items::load_items;
use crate::models::Item;
use crate::progress::Progress;
use crate::realtime::{run_realtime, HttpEmbedder, RealtimeEmbedder};
use crate::store::qdrant::QdrantStore;
use crate::store::VectorStore;

/// Assumed characters per token for the pre-chunk cost estimate.
const CHARS_PER_TOKEN: f64 = 4.0;
/// Items sampled for the mean-length estimate.
const COST_SAMPLE: usize = 256;

pub async fn run_ingest(config: &Config) -> Result<()> {
    let store: Arc<dyn VectorStore> = Arc::new(QdrantStore::new(
        &config.qdrant_url,
        &config.collection,
        config.embed.dims,
    )?);
    run_ingest_with_store(config, store).await
}

/// Orchestrate against any store backend (tests use the memory store).
pub async fn run_ingest_with_store(config: &Config, store: Arc<dyn VectorStore>) -> Result<()> {
    let provider = config.embed.provider;
    store.ensure_collection().await?;

    println!("Scanning existing points in '{}'...", config.collection);
    let mut skip_ids = store.existing_ids().await?;
    println!("  {} already indexed", skip_ids.len());

    let filenames = list_readme_files(config)?;
    println!("  {} README files on disk", filenames.len());

    let keys = KeyRing::from_env(provider, config.embed.keys)?;
    let outer_chunk = config.embed.chunk_size * config.embed.parallel * 2;

    let mut total_embedded = 0u64;

    if provider.is_batch() {
        let state = BatchStateStore::load(&config.batch_state_path())?;
        let endpoint = Arc::new(HttpBatchEndpoint::new(provider.batch_base_url(), keys)?);
        let driver = BatchDriver::new(
            endpoint,
            store.clone(),
            state,
            provider.model(),
            config.embed.dims,
            config.embed.chunk_size,
            config.embed.parallel,
            Duration::from_secs(config.embed.poll_interval_secs),
        );

        // Resume before any new submission: settle completed batches,
        // re-queue live ones, and exclude their items from this run.
        let (in_flight, mut pending) = driver.resume().await?;
        skip_ids.extend(in_flight);

        for file_chunk in filenames.chunks(outer_chunk) {
            let items = load_items(
                &config.readmes_dir,
                file_chunk,
                &skip_ids,
                config.embed.max_content_len,
                config.embed.file_readers,
            )
            .await?;
            announce_chunk(&items, config.embed.price_per_mtok);

            let ids: Vec<Uuid> = items.iter().map(|i| i.id).collect();
            driver.clone().run(items, std::mem::take(&mut pending)).await?;
            total_embedded += ids.len() as u64;
            skip_ids.extend(ids);
        }
        // No new items, but resumed batches may still need polling.
        if !pending.is_empty() {
            driver.clone().run(Vec::new(), pending).await?;
        }
    } else {
        let embedder: Arc<dyn RealtimeEmbedder> = Arc::new(HttpEmbedder::new(
            provider,
            keys,
            config.embed.dims,
            config.embed.price_per_mtok,
        )?);

        for file_chunk in filenames.chunks(outer_chunk) {
            let items = load_items(
                &config.readmes_dir,
                file_chunk,
                &skip_ids,
                config.embed.max_content_len,
                config.embed.file_readers,
            )
            .await?;
            announce_chunk(&items, config.embed.price_per_mtok);

            let ids: Vec<Uuid> = items.iter().map(|i| i.id).collect();
            total_embedded += run_realtime_chunk(config, embedder.clone(), store.clone(), items).await?;
            skip_ids.extend(ids);
        }
    }

    println!("ingest {} done", provider.name());
    println!("  items processed: {}", total_embedded);
    println!("  points in store: {}", store.count().await?);
    Ok(())
}

/// Feed one outer chunk through the bounded buffer and the worker pool.
async fn run_realtime_chunk(
    config: &Config,
    embedder: Arc<dyn RealtimeEmbedder>,
    store: Arc<dyn VectorStore>,
    items: Vec<Item>,
) -> Result<u64> {
    if items.is_empty() {
        return Ok(0);
    }
    let buffer = Arc::new(AsyncBuffer::new(
        config.embed.workers * config.embed.batch_size,
        config.embed.batch_size,
    ));
    let progress = Arc::new(Progress::new("realtime", items.len() as u64));

    let producer = {
        let buffer = buffer.clone();
        tokio::spawn(async move {
            for item in items {
                // push returns false once the drivers finished the
                // buffer (budget stop); nothing left to feed.
                if !buffer.push(item).await {
                    break;
                }
            }
            buffer.finish().await;
        })
    };

    let result = run_realtime(&config.embed, embedder, buffer, store, progress).await;
    producer.await.context("producer task panicked")?;
    result
}

/// All README artifacts in the directory, sorted for a stable outer loop.
fn list_readme_files(config: &Config) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let entries = std::fs::read_dir(&config.readmes_dir).with_context(|| {
        format!(
            "failed to read README directory: {}",
            config.readmes_dir.display()
        )
    })?;
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        names.push(name);
    }
    names.sort_unstable();
    Ok(names)
}

fn announce_chunk(items: &[Item], price_per_mtok: f64) {
    let (mtok, dollars) = estimate_cost(items, price_per_mtok);
    println!(
        "Chunk: {} items, ~{:.1}M tokens, estimated ${:.2}",
        items.len(),
        mtok,
        dollars
    );
}

/// Estimate `(millions of tokens, dollars)` from a sampled mean length.
fn estimate_cost(items: &[Item], price_per_mtok: f64) -> (f64, f64) {
    if items.is_empty() {
        return (0.0, 0.0);
    }
    let sample: Vec<usize> = items
        .iter()
        .take(COST_SAMPLE)
        .map(|i| i.content.chars().count())
        .collect();
    let mean = sample.iter().sum::<usize>() as f64 / sample.len() as f64;
    let tokens = mean * items.len() as f64 / CHARS_PER_TOKEN;
    let mtok = tokens / 1_000_000.0;
    (mtok, mtok * price_per_mtok)
}
