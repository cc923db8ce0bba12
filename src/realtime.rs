//! Realtime embed driver: a fixed worker pool over the shared buffer.
//!
//! Each of the W workers repeatedly pulls a batch, packs it into
//! sub-batches respecting both the item-count limit and the char budget
//! (whichever fires first), embeds, and upserts without waiting for
//! server-side indexing. Per-item failures are logged with the repo name
//! and skipped — a worker never takes the process down.
//!
//! A 402 from the provider flips the shared stop flag and finishes the
//! buffer, so all workers drain promptly and everything already upserted
//! stays durable; the driver then surfaces [`BudgetExhausted`] for the
//! orchestrator's graceful exit.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;

use crate::buffer::AsyncBuffer;
use crate::config::EmbedConfig;
use crate::embedding::{embed_realtime, EmbedResponse, KeyRing, Provider};
use crate::models::{is_budget_exhausted, BudgetExhausted, Item};
use crate::progress::Progress;
use crate::store::{Point, PointPayload, VectorStore};

/// Realtime embedding boundary; scripted in tests.
#[async_trait]
pub trait RealtimeEmbedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<EmbedResponse>;
}

/// Production embedder over the provider's realtime endpoint.
pub struct HttpEmbedder {
    client: reqwest::Client,
    provider: Provider,
    keys: KeyRing,
    dims: usize,
    price_per_mtok: f64,
}

impl HttpEmbedder {
    pub fn new(provider: Provider, keys: KeyRing, dims: usize, price_per_mtok: f64) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(120))
                .build()?,
            provider,
            keys,
            dims,
            price_per_mtok,
        })
    }
}

#[async_trait]
impl RealtimeEmbedder for HttpEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<EmbedResponse> {
        embed_realtime(
            &self.client,
            self.provider,
            &self.keys,
            self.dims,
            texts,
            self.price_per_mtok,
        )
        .await
    }
}

/// Run the worker pool until the buffer drains. Returns the number of
/// items upserted, or [`BudgetExhausted`] once all workers have stopped.
pub async fn run_realtime(
    embed_config: &EmbedConfig,
    embedder: Arc<dyn RealtimeEmbedder>,
    buffer: Arc<AsyncBuffer<Item>>,
    store: Arc<dyn VectorStore>,
    progress: Arc<Progress>,
) -> Result<u64> {
    let stop = Arc::new(AtomicBool::new(false));
    let mut workers = JoinSet::new();

    for _ in 0..embed_config.workers {
        let embedder = embedder.clone();
        let buffer = buffer.clone();
        let store = store.clone();
        let progress = progress.clone();
        let stop = stop.clone();
        let batch_size = embed_config.batch_size;
        let max_batch_chars = embed_config.max_batch_chars;

        workers.spawn(async move {
            let mut embedded = 0u64;
            'outer: while let Some(batch) = buffer.pull().await {
                for sub in pack_batches(&batch, batch_size, max_batch_chars) {
                    if stop.load(Ordering::Relaxed) {
                        break 'outer;
                    }
                    let texts: Vec<String> = sub.iter().map(|i| i.content.clone()).collect();
                    match embedder.embed(&texts).await {
                        Ok(resp) => {
                            if resp.embeddings.len() != sub.len() {
                                eprintln!(
                                    "Warning: provider returned {} vectors for {} texts",
                                    resp.embeddings.len(),
                                    sub.len()
                                );
                                continue;
                            }
                            let points: Vec<Point> = sub
                                .iter()
                                .zip(resp.embeddings)
                                .map(|(item, vector)| Point {
                                    id: item.id,
                                    vector,
                                    payload: PointPayload {
                                        repo_name: item.repo.clone(),
                                        content_hash: item.content_hash.clone(),
                                    },
                                })
                                .collect();
                            match store.upsert(&points, false).await {
                                Ok(()) => {
                                    embedded += points.len() as u64;
                                    progress.record(points.len() as u64, resp.tokens, resp.cost);
                                }
                                Err(e) => {
                                    eprintln!("Warning: upsert failed: {}", e);
                                    for item in sub {
                                        eprintln!("  not upserted: {}", item.repo);
                                    }
                                }
                            }
                        }
                        Err(e) if is_budget_exhausted(&e) => {
                            stop.store(true, Ordering::Relaxed);
                            buffer.finish().await;
                            break 'outer;
                        }
                        Err(e) => {
                            eprintln!("Warning: embedding sub-batch failed: {}", e);
                            for item in sub {
                                eprintln!("  not embedded: {}", item.repo);
                            }
                        }
                    }
                }
            }
            embedded
        });
    }

    let mut total = 0u64;
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(embedded) => total += embedded,
            Err(e) => eprintln!("Warning: embed worker panicked: {}", e),
        }
    }

    if stop.load(Ordering::Relaxed) {
        return Err(anyhow::Error::new(BudgetExhausted).context(format!(
            "stopped after {} items; rerun to continue once the budget is topped up",
            total
        )));
    }
    Ok(total)
}

/// Split a batch into sub-batches bounded by item count and char budget.
/// Every sub-batch holds at least one item, so a single oversized README
/// still ships alone rather than stalling the pipeline.
fn pack_batches(items: &[Item], max_count: usize, max_chars: usize) -> Vec<Vec<Item>> {
    let mut packed = Vec::new();
    let mut current: Vec<Item> = Vec::new();
    let mut chars = 0usize;

    for item in items {
        let len = item.content.chars().count();
        if !current.is_empty() && (current.len() >= max_count || chars + len > max_chars) {
            packed.push(std::mem::take(&mut current));
            chars = 0;
        }
        chars += len;
        current.push(item.clone());
    }
    if !current.is_empty() {
        packed.push(current);
    }
    packed
}
