//! Batch embed driver: the provider's asynchronous batch endpoint.
//!
//! Items are split into chunks of `chunk_size`, with up to `parallel`
//! chunks in flight. Per chunk:
//!
//! 1. Build a newline-delimited manifest, one request per item keyed by
//!    `custom_id = item.id`.
//! 2. Upload the manifest, create a batch job over the returned file ID.
//! 3. Persist `{batch_id → item metadata}` to the state store *before*
//!    polling begins — the window between submission and upsert is where
//!    a crash would otherwise lose work.
//! 4. Poll until terminal; on completion, stream-download the NDJSON
//!    results keyed by `custom_id` (provider-side reordering is safe).
//! 5. Upsert and apply the retention rule: the state entry is deleted
//!    only when the success rate reaches 99% or the batch is small
//!    enough (< [`SMALL_BATCH`]) to write off; otherwise it stays for the
//!    next run to re-submit or an operator to inspect.
//!
//! Terminal non-success states (`failed`, `expired`, `cancelled`) error
//! the chunk with state retained. HTTP 402 anywhere maps to
//! [`BudgetExhausted`]: remaining chunks are not submitted, state is
//! preserved, and the orchestrator exits 0.
//!
//! # Resume
//!
//! [`BatchDriver::resume`] runs at pipeline start, before any new
//! submission: completed batches are settled, live ones are re-queued for
//! polling, and dead ones are dropped from state. The returned in-flight
//! ID set is excluded from the remaining work, which guarantees no
//! duplicate submission across process restarts and no omission when a
//! batch completed but never upserted.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::batch_state::BatchStateStore;
use crate::embedding::KeyRing;
use crate::models::{BudgetExhausted, Item, ItemMeta};
use crate::store::{Point, PointPayload, VectorStore};

/// Batches below this size are written off rather than retained on a
/// poor success rate; re-driving a handful of items costs less than the
/// bookkeeping.
pub const SMALL_BATCH: usize = 50;

/// Success rate at which a batch's state entry may be deleted.
pub const RETENTION_SUCCESS_RATE: f64 = 0.99;

/// Provider-observed batch lifecycle state.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchStatus {
    Validating,
    InProgress { completed: u64, total: u64 },
    Completed { output_file_id: String },
    Failed,
    Expired,
    Cancelled,
}

/// Parsed contents of a downloaded results file.
#[derive(Debug, Default)]
pub struct BatchResults {
    pub embeddings: HashMap<Uuid, Vec<f32>>,
    pub failed: Vec<(Uuid, String)>,
}

/// Asynchronous batch API boundary; scripted in tests.
#[async_trait]
pub trait BatchEndpoint: Send + Sync {
    /// Upload an NDJSON manifest; returns the provider file ID.
    async fn upload_manifest(&self, manifest: String) -> Result<String>;
    /// Create a batch job over an uploaded file; returns the batch ID.
    async fn create_batch(&self, input_file_id: &str) -> Result<String>;
    async fn get_status(&self, batch_id: &str) -> Result<BatchStatus>;
    /// Download and parse a completed batch's results file.
    async fn download_results(&self, output_file_id: &str) -> Result<BatchResults>;
}

/// One manifest line: the embedding request for a single item.
pub fn manifest_line(item: &Item, model: &str, dims: usize) -> String {
    serde_json::json!({
        "custom_id": item.id,
        "method": "POST",
        "url": "/v1/embeddings",
        "body": {
            "model": model,
            "input": [item.content],
            "dimensions": dims,
        }
    })
    .to_string()
}

pub fn build_manifest(items: &[Item], model: &str, dims: usize) -> String {
    let mut manifest = String::new();
    for item in items {
        manifest.push_str(&manifest_line(item, model, dims));
        manifest.push('\n');
    }
    manifest
}

/// Retention rule: keep the state entry unless the success rate clears
/// the bar or the batch is small enough to write off.
pub fn retain_state(total: usize, succeeded: usize) -> bool {
    if total < SMALL_BATCH {
        return false;
    }
    let rate = succeeded as f64 / total as f64;
    rate < RETENTION_SUCCESS_RATE
}

pub struct BatchDriver {
    endpoint: Arc<dyn BatchEndpoint>,
    store: Arc<dyn VectorStore>,
    state: Arc<Mutex<BatchStateStore>>,
    model: String,
    dims: usize,
    chunk_size: usize,
    parallel: usize,
    poll_interval: Duration,
    /// Set on the first 402; stops further submissions.
    budget_hit: AtomicBool,
}

impl BatchDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        endpoint: Arc<dyn BatchEndpoint>,
        store: Arc<dyn VectorStore>,
        state: BatchStateStore,
        model: &str,
        dims: usize,
        chunk_size: usize,
        parallel: usize,
        poll_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            endpoint,
            store,
            state: Arc::new(Mutex::new(state)),
            model: model.to_string(),
            dims,
            chunk_size,
            parallel,
            poll_interval,
            budget_hit: AtomicBool::new(false),
        })
    }

    /// Replay the state store before submitting anything new.
    ///
    /// Returns the IDs of items still in flight (to exclude from the
    /// remaining work) and the batch IDs that need further polling.
    pub async fn resume(&self) -> Result<(HashSet<Uuid>, Vec<String>)> {
        let batch_ids = self.state.lock().await.batch_ids();
        if !batch_ids.is_empty() {
            println!("Resuming {} batch(es) from state", batch_ids.len());
        }

        let mut in_flight = HashSet::new();
        let mut pending = Vec::new();

        for batch_id in batch_ids {
            let status = self
                .endpoint
                .get_status(&batch_id)
                .await
                .with_context(|| format!("status check failed for batch {}", batch_id))?;
            match status {
                BatchStatus::Completed { output_file_id } => {
                    let metas = match self.state.lock().await.get(&batch_id) {
                        Some(entry) => entry.items.clone(),
                        None => continue,
                    };
                    self.settle(&batch_id, &metas, &output_file_id).await?;
                }
                BatchStatus::Validating | BatchStatus::InProgress { .. } => {
                    if let Some(entry) = self.state.lock().await.get(&batch_id) {
                        in_flight.extend(entry.items.iter().map(|m| m.id));
                    }
                    pending.push(batch_id);
                }
                BatchStatus::Failed | BatchStatus::Expired | BatchStatus::Cancelled => {
                    eprintln!("Warning: dropping batch {} ({:?})", batch_id, status);
                    self.state.lock().await.remove(&batch_id)?;
                }
            }
        }

        Ok((in_flight, pending))
    }

    /// Drive `pending` batches (from resume) plus new chunks of `items`
    /// to completion, at most `parallel` chunks concurrently.
    pub async fn run(self: Arc<Self>, items: Vec<Item>, pending: Vec<String>) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.parallel));
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();

        for batch_id in pending {
            let driver = self.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .context("batch semaphore closed")?;
                let metas = match driver.state.lock().await.get(&batch_id) {
                    Some(entry) => entry.items.clone(),
                    None => return Ok(()),
                };
                let output = driver.poll_to_completion(&batch_id).await?;
                driver.settle(&batch_id, &metas, &output).await
            });
        }

        let chunks: Vec<Vec<Item>> = items
            .chunks(self.chunk_size)
            .map(|c| c.to_vec())
            .collect();
        let total_chunks = chunks.len();
        for (index, chunk) in chunks.into_iter().enumerate() {
            let driver = self.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .context("batch semaphore closed")?;
                if driver.budget_hit.load(Ordering::Relaxed) {
                    // Budget died under an earlier chunk; leave this one
                    // unsubmitted for the next run.
                    return Ok(());
                }
                let result = driver.process_chunk(chunk, index + 1, total_chunks).await;
                if let Err(ref e) = result {
                    if crate::models::is_budget_exhausted(e) {
                        driver.budget_hit.store(true, Ordering::Relaxed);
                    }
                }
                result
            });
        }

        let mut first_err: Option<anyhow::Error> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    eprintln!("Warning: batch chunk failed: {:#}", e);
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
                Err(e) => {
                    eprintln!("Warning: batch task panicked: {}", e);
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn process_chunk(&self, chunk: Vec<Item>, index: usize, total: usize) -> Result<()> {
        let manifest = build_manifest(&chunk, &self.model, self.dims);
        let metas: Vec<ItemMeta> = chunk.iter().map(ItemMeta::of).collect();

        let file_id = self
            .endpoint
            .upload_manifest(manifest)
            .await
            .context("manifest upload failed")?;
        let batch_id = self
            .endpoint
            .create_batch(&file_id)
            .await
            .context("batch create failed")?;

        // State first: a crash after this point loses nothing.
        self.state.lock().await.insert(&batch_id, metas.clone())?;
        println!(
            "[batch {}/{}] submitted {} items as {}",
            index,
            total,
            chunk.len(),
            batch_id
        );

        let output = self.poll_to_completion(&batch_id).await?;
        self.settle(&batch_id, &metas, &output).await
    }

    /// Poll until `Completed`, reporting progress. Terminal non-success
    /// states error out with the state entry retained for inspection.
    async fn poll_to_completion(&self, batch_id: &str) -> Result<String> {
        loop {
            match self.endpoint.get_status(batch_id).await? {
                BatchStatus::Completed { output_file_id } => return Ok(output_file_id),
                BatchStatus::Validating => {}
                BatchStatus::InProgress { completed, total } => {
                    eprintln!("[batch {}] {}/{}", batch_id, completed, total);
                }
                status @ (BatchStatus::Failed | BatchStatus::Expired | BatchStatus::Cancelled) => {
                    bail!("batch {} ended {:?}; state retained", batch_id, status);
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Download, upsert, and apply the retention rule.
    async fn settle(&self, batch_id: &str, metas: &[ItemMeta], output_file_id: &str) -> Result<()> {
        let results = self
            .endpoint
            .download_results(output_file_id)
            .await
            .with_context(|| format!("result download failed for batch {}", batch_id))?;

        let repos: HashMap<Uuid, &str> = metas.iter().map(|m| (m.id, m.repo.as_str())).collect();
        for (id, error) in &results.failed {
            let repo = repos.get(id).copied().unwrap_or("<unknown>");
            eprintln!("  failed item: {} ({})", repo, error);
        }

        let points: Vec<Point> = metas
            .iter()
            .filter_map(|meta| {
                results.embeddings.get(&meta.id).map(|vector| Point {
                    id: meta.id,
                    vector: vector.clone(),
                    payload: PointPayload {
                        repo_name: meta.repo.clone(),
                        content_hash: meta.content_hash.clone(),
                    },
                })
            })
            .collect();

        self.store.upsert(&points, false).await?;

        if retain_state(metas.len(), points.len()) {
            eprintln!(
                "Warning: batch {} upserted {}/{}; state retained for rerun",
                batch_id,
                points.len(),
                metas.len()
            );
        } else {
            self.state.lock().await.remove(batch_id)?;
        }

        println!(
            "[batch {}] done: {}/{} upserted",
            batch_id,
            points.len(),
            metas.len()
        );
        Ok(())
    }
}

// ── HTTP implementation ───────────────────────────────────────

/// Reqwest-backed [`BatchEndpoint`] over the OpenAI-style batch API.
pub struct HttpBatchEndpoint {
    client: reqwest::Client,
    base_url: String,
    keys: KeyRing,
}

#[derive(Deserialize)]
struct FileEnvelope {
    id: String,
}

#[derive(Deserialize)]
struct BatchEnvelope {
    id: String,
    status: Option<String>,
    output_file_id: Option<String>,
    request_counts: Option<RequestCounts>,
}

#[derive(Deserialize)]
struct RequestCounts {
    #[serde(default)]
    completed: u64,
    #[serde(default)]
    total: u64,
}

#[derive(Deserialize)]
struct ResultLine {
    custom_id: Uuid,
    response: Option<ResultResponse>,
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ResultResponse {
    body: Option<ResultBody>,
}

#[derive(Deserialize)]
struct ResultBody {
    data: Vec<ResultDatum>,
}

#[derive(Deserialize)]
struct ResultDatum {
    embedding: Vec<f32>,
}

impl HttpBatchEndpoint {
    pub fn new(base_url: &str, keys: KeyRing) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(300))
                .build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            keys,
        })
    }

    fn check_budget(status: reqwest::StatusCode) -> Result<()> {
        if status.as_u16() == 402 {
            return Err(anyhow::Error::new(BudgetExhausted));
        }
        Ok(())
    }
}

#[async_trait]
impl BatchEndpoint for HttpBatchEndpoint {
    async fn upload_manifest(&self, manifest: String) -> Result<String> {
        let part = reqwest::multipart::Part::bytes(manifest.into_bytes())
            .file_name("batch.jsonl")
            .mime_str("application/jsonl")?;
        let form = reqwest::multipart::Form::new()
            .text("purpose", "batch")
            .part("file", part);

        let resp = self
            .client
            .post(format!("{}/files", self.base_url))
            .header("Authorization", format!("Bearer {}", self.keys.next()))
            .multipart(form)
            .send()
            .await?;
        Self::check_budget(resp.status())?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("file upload returned {}: {}", status, text);
        }
        let envelope: FileEnvelope = resp.json().await?;
        Ok(envelope.id)
    }

    async fn create_batch(&self, input_file_id: &str) -> Result<String> {
        let body = serde_json::json!({
            "input_file_id": input_file_id,
            "endpoint": "/v1/embeddings",
            "completion_window": "24h",
        });
        let resp = self
            .client
            .post(format!("{}/batches", self.base_url))
            .header("Authorization", format!("Bearer {}", self.keys.next()))
            .json(&body)
            .send()
            .await?;
        Self::check_budget(resp.status())?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("batch create returned {}: {}", status, text);
        }
        let envelope: BatchEnvelope = resp.json().await?;
        Ok(envelope.id)
    }

    async fn get_status(&self, batch_id: &str) -> Result<BatchStatus> {
        let resp = self
            .client
            .get(format!("{}/batches/{}", self.base_url, batch_id))
            .header("Authorization", format!("Bearer {}", self.keys.next()))
            .send()
            .await?;
        Self::check_budget(resp.status())?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("batch status returned {}: {}", status, text);
        }
        let envelope: BatchEnvelope = resp.json().await?;
        match envelope.status.as_deref() {
            Some("validating") => Ok(BatchStatus::Validating),
            Some("in_progress") | Some("finalizing") => {
                let counts = envelope.request_counts.unwrap_or(RequestCounts {
                    completed: 0,
                    total: 0,
                });
                Ok(BatchStatus::InProgress {
                    completed: counts.completed,
                    total: counts.total,
                })
            }
            Some("completed") => {
                let output_file_id = envelope
                    .output_file_id
                    .context("completed batch without output_file_id")?;
                Ok(BatchStatus::Completed { output_file_id })
            }
            Some("failed") => Ok(BatchStatus::Failed),
            Some("expired") => Ok(BatchStatus::Expired),
            Some("cancelled") | Some("cancelling") => Ok(BatchStatus::Cancelled),
            other => bail!("unknown batch status: {:?}", other),
        }
    }

    async fn download_results(&self, output_file_id: &str) -> Result<BatchResults> {
        let resp = self
            .client
            .get(format!("{}/files/{}/content", self.base_url, output_file_id))
            .header("Authorization", format!("Bearer {}", self.keys.next()))
            .send()
            .await?;
        Self::check_budget(resp.status())?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("result download returned {}: {}", status, text);
        }

        // Stream the body line by line; result files for a 25k-item
        // chunk run to hundreds of MB.
        let mut results = BatchResults::default();
        let mut stream = resp.bytes_stream();
        let mut buf = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("result stream interrupted")?;
            buf.extend_from_slice(&chunk);
            while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                parse_result_line(&line[..line.len() - 1], &mut results);
            }
        }
        if !buf.is_empty() {
            parse_result_line(&buf, &mut results);
        }
        Ok(results)
    }
}

fn parse_result_line(line: &[u8], results: &mut BatchResults) {
    if line.iter().all(|b| b.is_ascii_whitespace()) {
        return;
    }
    let parsed: ResultLine = match serde_json::from_slice(line) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Warning: unparseable result line: {}", e);
            return;
        }
    };
    if let Some(error) = parsed.error {
        results.failed.push((parsed.custom_id, error.to_string()));
        return;
    }
    match parsed
        .response
        .and_then(|r| r.body)
        .and_then(|b| b.data.into_iter().next())
    {
        Some(datum) => {
            results.embeddings.insert(parsed.custom_id, datum.embedding);
        }
        None => {
            results
                .failed
                .push((parsed.custom_id, "missing embedding in response".to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{item_id_from_hash, sha1_hex};
    use crate::store::memory::MemoryStore;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    fn item(content: &str, repo: &str) -> Item {
        let content_hash = sha1_hex(content);
        Item {
            id: item_id_from_hash(&content_hash).unwrap(),
            repo: repo.to_string(),
            content: content.to_string(),
            content_hash,
        }
    }

    fn items(n: usize) -> Vec<Item> {
        (0..n)
            .map(|i| item(&format!("batch readme {} body text", i), &format!("o{}/r{}", i, i)))
            .collect()
    }

    /// Scripted endpoint. Uploaded manifests are parsed so downloads can
    /// return one embedding per custom_id; per-batch status sequences are
    /// consumed one `get_status` at a time.
    #[derive(Default)]
    struct StubEndpoint {
        manifests: StdMutex<HashMap<String, Vec<Uuid>>>,
        statuses: StdMutex<HashMap<String, VecDeque<BatchStatus>>>,
        /// IDs the provider should fail instead of embedding.
        poison: StdMutex<HashSet<Uuid>>,
        counter: StdMutex<usize>,
    }

    impl StubEndpoint {
        fn script(&self, batch_id: &str, statuses: Vec<BatchStatus>) {
            self.statuses
                .lock()
                .unwrap()
                .insert(batch_id.to_string(), statuses.into());
        }

        fn register_file(&self, file_id: &str, ids: Vec<Uuid>) {
            self.manifests
                .lock()
                .unwrap()
                .insert(file_id.to_string(), ids);
        }
    }

    #[async_trait]
    impl BatchEndpoint for StubEndpoint {
        async fn upload_manifest(&self, manifest: String) -> Result<String> {
            let ids: Vec<Uuid> = manifest
                .lines()
                .map(|line| {
                    let v: serde_json::Value = serde_json::from_str(line).unwrap();
                    Uuid::parse_str(v["custom_id"].as_str().unwrap()).unwrap()
                })
                .collect();
            let mut counter = self.counter.lock().unwrap();
            *counter += 1;
            let file_id = format!("file_{}", counter);
            self.manifests.lock().unwrap().insert(file_id.clone(), ids);
            Ok(file_id)
        }

        async fn create_batch(&self, input_file_id: &str) -> Result<String> {
            let batch_id = input_file_id.replace("file_", "batch_");
            // Map the output file to the same IDs and default the status
            // script to immediate completion.
            let ids = self
                .manifests
                .lock()
                .unwrap()
                .get(input_file_id)
                .cloned()
                .unwrap();
            let output = input_file_id.replace("file_", "out_");
            self.manifests.lock().unwrap().insert(output.clone(), ids);
            self.statuses
                .lock()
                .unwrap()
                .entry(batch_id.clone())
                .or_insert_with(|| {
                    vec![BatchStatus::Completed {
                        output_file_id: output,
                    }]
                    .into()
                });
            Ok(batch_id)
        }

        async fn get_status(&self, batch_id: &str) -> Result<BatchStatus> {
            let mut statuses = self.statuses.lock().unwrap();
            let queue = statuses
                .get_mut(batch_id)
                .with_context(|| format!("no scripted status for {}", batch_id))?;
            // The last status repeats forever.
            if queue.len() > 1 {
                Ok(queue.pop_front().unwrap())
            } else {
                Ok(queue.front().cloned().unwrap())
            }
        }

        async fn download_results(&self, output_file_id: &str) -> Result<BatchResults> {
            let ids = self
                .manifests
                .lock()
                .unwrap()
                .get(output_file_id)
                .cloned()
                .with_context(|| format!("no file registered: {}", output_file_id))?;
            let poison = self.poison.lock().unwrap();
            let mut results = BatchResults::default();
            for id in ids {
                if poison.contains(&id) {
                    results.failed.push((id, "embedding failed".to_string()));
                } else {
                    results.embeddings.insert(id, vec![0.25, 0.75]);
                }
            }
            Ok(results)
        }
    }

    fn driver(
        tmp: &TempDir,
        endpoint: Arc<StubEndpoint>,
        store: Arc<MemoryStore>,
        chunk_size: usize,
    ) -> Arc<BatchDriver> {
        let state = BatchStateStore::load(&tmp.path().join("batch-state.json")).unwrap();
        BatchDriver::new(
            endpoint,
            store,
            state,
            "model-x",
            1536,
            chunk_size,
            3,
            Duration::from_millis(5),
        )
    }

    #[test]
    fn manifest_lines_round_trip() {
        let all = items(3);
        let manifest = build_manifest(&all, "model-x", 1536);
        let lines: Vec<&str> = manifest.lines().collect();
        assert_eq!(lines.len(), 3);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["custom_id"], all[0].id.to_string());
        assert_eq!(first["url"], "/v1/embeddings");
        assert_eq!(first["body"]["model"], "model-x");
        assert_eq!(first["body"]["dimensions"], 1536);
        assert_eq!(first["body"]["input"][0], all[0].content);
    }

    #[test]
    fn retention_rule_boundaries() {
        // 49 items at 50%: small batch, state deleted.
        assert!(!retain_state(49, 24));
        // 50 items at 98%: retained.
        assert!(retain_state(50, 49));
        // 50 items at 100%: deleted.
        assert!(!retain_state(50, 50));
        // Exactly 99%: deleted.
        assert!(!retain_state(100, 99));
        assert!(retain_state(100, 98));
    }

    #[tokio::test]
    async fn chunk_submits_settles_and_clears_state() {
        let tmp = TempDir::new().unwrap();
        let endpoint = Arc::new(StubEndpoint::default());
        let store = Arc::new(MemoryStore::new());
        let driver = driver(&tmp, endpoint, store.clone(), 100);

        let all = items(60);
        driver.clone().run(all.clone(), Vec::new()).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 60);
        let point = store.get(&all[0].id).unwrap();
        assert_eq!(point.payload.repo_name, "o0/r0");
        assert!(driver.state.lock().await.is_empty());
    }

    #[tokio::test]
    async fn items_split_into_chunks() {
        let tmp = TempDir::new().unwrap();
        let endpoint = Arc::new(StubEndpoint::default());
        let store = Arc::new(MemoryStore::new());
        let driver = driver(&tmp, endpoint.clone(), store.clone(), 25);

        driver.clone().run(items(60), Vec::new()).await.unwrap();

        // 60 items at chunk size 25 → three uploads.
        assert_eq!(*endpoint.counter.lock().unwrap(), 3);
        assert_eq!(store.count().await.unwrap(), 60);
    }

    #[tokio::test]
    async fn poor_success_rate_retains_state_for_rerun() {
        let tmp = TempDir::new().unwrap();
        let endpoint = Arc::new(StubEndpoint::default());
        let store = Arc::new(MemoryStore::new());

        let all = items(60);
        // Poison 10 of 60: 83% success on a non-small batch.
        {
            let mut poison = endpoint.poison.lock().unwrap();
            for item in &all[..10] {
                poison.insert(item.id);
            }
        }

        let driver = driver(&tmp, endpoint, store.clone(), 100);
        driver.clone().run(all, Vec::new()).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 50);
        assert_eq!(driver.state.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn resume_settles_a_batch_completed_while_down() {
        let tmp = TempDir::new().unwrap();
        let endpoint = Arc::new(StubEndpoint::default());
        let store = Arc::new(MemoryStore::new());
        let all = items(40);

        // A previous process submitted batch_9 and died mid-poll.
        {
            let mut state = BatchStateStore::load(&tmp.path().join("batch-state.json")).unwrap();
            state
                .insert("batch_9", all.iter().map(ItemMeta::of).collect())
                .unwrap();
        }
        endpoint.register_file("out_9", all.iter().map(|i| i.id).collect());
        endpoint.script(
            "batch_9",
            vec![BatchStatus::Completed {
                output_file_id: "out_9".to_string(),
            }],
        );

        let driver = driver(&tmp, endpoint, store.clone(), 100);
        let (in_flight, pending) = driver.resume().await.unwrap();
        assert!(in_flight.is_empty());
        assert!(pending.is_empty());
        assert_eq!(store.count().await.unwrap(), 40);
        assert!(driver.state.lock().await.is_empty());
    }

    #[tokio::test]
    async fn resume_requeues_a_live_batch_and_excludes_its_items() {
        let tmp = TempDir::new().unwrap();
        let endpoint = Arc::new(StubEndpoint::default());
        let store = Arc::new(MemoryStore::new());
        let all = items(40);

        {
            let mut state = BatchStateStore::load(&tmp.path().join("batch-state.json")).unwrap();
            state
                .insert("batch_9", all.iter().map(ItemMeta::of).collect())
                .unwrap();
        }
        endpoint.register_file("out_9", all.iter().map(|i| i.id).collect());
        endpoint.script(
            "batch_9",
            vec![
                BatchStatus::InProgress {
                    completed: 10,
                    total: 40,
                },
                BatchStatus::InProgress {
                    completed: 30,
                    total: 40,
                },
                BatchStatus::Completed {
                    output_file_id: "out_9".to_string(),
                },
            ],
        );

        let driver = driver(&tmp, endpoint, store.clone(), 100);
        let (in_flight, pending) = driver.resume().await.unwrap();
        assert_eq!(in_flight.len(), 40);
        assert!(in_flight.contains(&all[0].id));
        assert_eq!(pending, vec!["batch_9".to_string()]);

        // Polling the requeued batch to completion upserts everything.
        driver.clone().run(Vec::new(), pending).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 40);
        assert!(driver.state.lock().await.is_empty());
    }

    #[tokio::test]
    async fn resume_drops_dead_batches() {
        let tmp = TempDir::new().unwrap();
        let endpoint = Arc::new(StubEndpoint::default());
        let store = Arc::new(MemoryStore::new());

        {
            let mut state = BatchStateStore::load(&tmp.path().join("batch-state.json")).unwrap();
            state
                .insert("batch_dead", items(5).iter().map(ItemMeta::of).collect())
                .unwrap();
        }
        endpoint.script("batch_dead", vec![BatchStatus::Expired]);

        let driver = driver(&tmp, endpoint, store, 100);
        let (in_flight, pending) = driver.resume().await.unwrap();
        assert!(in_flight.is_empty());
        assert!(pending.is_empty());
        assert!(driver.state.lock().await.is_empty());
    }

    #[tokio::test]
    async fn terminal_state_mid_run_errors_and_retains_state() {
        let tmp = TempDir::new().unwrap();
        let endpoint = Arc::new(StubEndpoint::default());
        let store = Arc::new(MemoryStore::new());

        // Pre-script batch_1 to fail; create_batch will keep this script
        // because or_insert only fills missing entries.
        endpoint.script("batch_1", vec![BatchStatus::Failed]);

        let driver = driver(&tmp, endpoint, store.clone(), 100);
        let err = driver.clone().run(items(60), Vec::new()).await.unwrap_err();
        assert!(err.to_string().contains("Failed"));
        assert_eq!(store.count().await.unwrap(), 0);
        assert_eq!(driver.state.lock().await.len(), 1);
    }
}
