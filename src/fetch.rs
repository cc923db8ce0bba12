//! Fetch engine: origin URL → exactly one durable outcome.
//!
//! For each repo the engine sweeps the candidate space `README_NAMES ×
//! BRANCHES` against raw hosting, in fixed order — `README.md` first,
//! then the historically most common branch first. The first HTTP 200
//! wins. The outcome is always durable:
//!
//! - a README artifact `<owner>_<repo>_<branch>_<filename>`, or
//! - an empty error marker `<errors>/<status>/<owner>_<repo>`, or
//! - a skip, when either already exists.
//!
//! Because every outcome lands on the filesystem, a restart (or a sibling
//! process working a disjoint slice) never re-attempts completed work.
//!
//! # API fallback
//!
//! When the raw sweep comes up empty, the engine asks the GitHub REST
//! API (`/repos/{owner}/{repo}/readme`) before writing a marker. The
//! API knows the real default branch, so it rescues repos whose README
//! lives on neither `master` nor `main`; its answers are stored under
//! the `default` branch token. Authenticated with `GITHUB_TOKEN` when
//! set, anonymous (and tightly rate-limited) otherwise.
//!
//! # Retry
//!
//! Each HTTP request gets up to `max_retries` attempts with a fresh proxy
//! per attempt. Transient statuses (429, 500, 502, 503, 504) back off
//! `2^retry` seconds; network-layer failures retry immediately — the
//! proxy's EMA penalty already encodes the wait. A repo whose candidates
//! all 404 gets a `404_<N>` marker carrying the number of candidates
//! tested, so a future run with a grown candidate list can re-attempt it.
//! HTTP 451 short-circuits the whole repo.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::{Config, FetchConfig};
use crate::models::{
    readme_file_name, repo_from_origin, repo_stem, truncate_chars, Origin, MAX_FILE_NAME_BYTES,
};
use crate::origins::{WorkParams, WorkSource};
use crate::proxy::ProxyPool;

/// README filename candidates, most common first.
pub const README_NAMES: &[&str] = &[
    "README.md",
    "readme.md",
    "Readme.md",
    "ReadMe.md",
    "README.markdown",
    "readme.markdown",
    "Readme.markdown",
    "README.mkd",
    "README.mdown",
    "README.mkdn",
    "README.asciidoc",
    "readme.asciidoc",
    "README.adoc",
    "readme.adoc",
    "README.rst",
    "readme.rst",
    "README.rdoc",
    "README.textile",
    "README.org",
    "README.txt",
    "Readme.txt",
    "readme.txt",
    "README.TXT",
    "README.MD",
    "readme.html",
    "README",
];

/// Appended when content exceeds the max-chars cap.
pub const TRUNCATION_MARKER: &str = "\n\n[TRUNCATED]";

const TRANSIENT_STATUSES: &[u16] = &[429, 500, 502, 503, 504];

/// Marker bucket for network-layer failures.
const NETWORK_BUCKET: &str = "0";
/// Marker bucket for under-sized content.
const TOO_SMALL_BUCKET: &str = "tooSmall";

/// Outcome of one candidate request, after retries.
#[derive(Debug, Clone)]
pub enum CandidateOutcome {
    /// HTTP 200 with a body.
    Content(String),
    /// A terminal non-200 status.
    Status(u16),
    /// Network-layer failure that survived all retries.
    NetworkFailed,
}

/// Raw hosting boundary. The production impl talks to
/// `raw.githubusercontent.com` and the GitHub REST API through the
/// proxy pool; tests script it.
#[async_trait]
pub trait ReadmeHost: Send + Sync {
    async fn fetch_candidate(&self, repo: &str, branch: &str, filename: &str) -> CandidateOutcome;

    /// Last-resort README lookup via the hosting provider's API, tried
    /// when the raw candidate sweep finds nothing. Returns the README's
    /// `(filename, content)` when the API knows one.
    async fn fetch_api_readme(&self, _repo: &str) -> Option<(String, String)> {
        None
    }
}

const USER_AGENT: &str = "readme-atlas";

/// Shape of `GET /repos/{owner}/{repo}/readme`.
#[derive(Deserialize)]
struct ApiReadme {
    name: String,
    /// Base64 with embedded line breaks.
    content: String,
}

/// Reqwest-backed [`ReadmeHost`] with proxy rotation and retry.
pub struct HttpReadmeHost {
    pool: Arc<ProxyPool>,
    direct: reqwest::Client,
    max_retries: u32,
    /// `GITHUB_TOKEN`, for the API fallback. Anonymous without it.
    token: Option<String>,
}

impl HttpReadmeHost {
    pub fn new(
        pool: Arc<ProxyPool>,
        max_retries: u32,
        timeout_secs: u64,
        token: Option<String>,
    ) -> Result<Self> {
        Ok(Self {
            pool,
            direct: reqwest::Client::builder()
                .timeout(Duration::from_secs(timeout_secs))
                .build()?,
            max_retries,
            token,
        })
    }

    /// One URL through the retry policy: fresh proxy per attempt,
    /// `2^retry` sleep on transient statuses, immediate retry on
    /// network failures.
    async fn request_with_retry(&self, url: &str, bearer: Option<&str>) -> CandidateOutcome {
        let mut last_transient: Option<u16> = None;
        for retry in 0..self.max_retries {
            let proxy_index = self.pool.select();
            let client = match proxy_index {
                Some(i) => self.pool.client(i).clone(),
                None => self.direct.clone(),
            };

            let mut request = client.get(url).header("User-Agent", USER_AGENT);
            if let Some(token) = bearer {
                request = request.header("Authorization", format!("Bearer {}", token));
            }

            let start = Instant::now();
            match request.send().await {
                Ok(resp) => {
                    if let Some(i) = proxy_index {
                        self.pool.record(i, start.elapsed().as_secs_f64() * 1000.0);
                    }
                    let status = resp.status().as_u16();
                    if status == 200 {
                        match resp.text().await {
                            Ok(body) => return CandidateOutcome::Content(body),
                            Err(_) => {
                                // Body read died mid-stream: a network
                                // failure as far as retry policy goes.
                                if let Some(i) = proxy_index {
                                    self.pool.record_failure(i);
                                }
                                continue;
                            }
                        }
                    }
                    if TRANSIENT_STATUSES.contains(&status) {
                        last_transient = Some(status);
                        if retry + 1 < self.max_retries {
                            tokio::time::sleep(Duration::from_secs(1u64 << retry)).await;
                            continue;
                        }
                        return CandidateOutcome::Status(status);
                    }
                    return CandidateOutcome::Status(status);
                }
                Err(_) => {
                    if let Some(i) = proxy_index {
                        self.pool.record_failure(i);
                    }
                    // New proxy next attempt; no sleep.
                    continue;
                }
            }
        }

        match last_transient {
            Some(status) => CandidateOutcome::Status(status),
            None => CandidateOutcome::NetworkFailed,
        }
    }
}

#[async_trait]
impl ReadmeHost for HttpReadmeHost {
    async fn fetch_candidate(&self, repo: &str, branch: &str, filename: &str) -> CandidateOutcome {
        let url = format!(
            "https://raw.githubusercontent.com/{}/{}/{}",
            repo, branch, filename
        );
        self.request_with_retry(&url, None).await
    }

    async fn fetch_api_readme(&self, repo: &str) -> Option<(String, String)> {
        let url = format!("https://api.github.com/repos/{}/readme", repo);
        match self.request_with_retry(&url, self.token.as_deref()).await {
            CandidateOutcome::Content(body) => parse_api_readme(repo, &body),
            _ => None,
        }
    }
}

/// Decode an API readme response into `(filename, content)`.
fn parse_api_readme(repo: &str, body: &str) -> Option<(String, String)> {
    let readme: ApiReadme = match serde_json::from_str(body) {
        Ok(readme) => readme,
        Err(e) => {
            eprintln!("Warning: bad API readme response for {}: {}", repo, e);
            return None;
        }
    };
    // The API wraps its base64 at 60 columns.
    let packed: String = readme.content.split_whitespace().collect();
    match BASE64.decode(packed) {
        Ok(bytes) => Some((readme.name, String::from_utf8_lossy(&bytes).into_owned())),
        Err(e) => {
            eprintln!("Warning: undecodable API readme for {}: {}", repo, e);
            None
        }
    }
}

/// Counters shared across fetch tasks.
#[derive(Default)]
pub struct FetchStats {
    pub processed: AtomicU64,
    pub success: AtomicU64,
    pub failed: AtomicU64,
    pub skipped: AtomicU64,
    pub too_small: AtomicU64,
    pub truncated: AtomicU64,
    pub api_fallbacks: AtomicU64,
}

impl FetchStats {
    fn bump(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn summary(&self) -> String {
        let mut line = format!(
            "{} saved, {} skipped, {} too small, {} truncated, {} failed",
            self.success.load(Ordering::Relaxed),
            self.skipped.load(Ordering::Relaxed),
            self.too_small.load(Ordering::Relaxed),
            self.truncated.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
        );
        let api = self.api_fallbacks.load(Ordering::Relaxed);
        if api > 0 {
            line.push_str(&format!(", {} via API fallback", api));
        }
        line
    }
}

/// How the engine answers "already done?" for a repo.
enum SkipIndex {
    /// Primary mode: both sets preloaded once at startup.
    Preloaded {
        existing: HashSet<String>,
        errored: HashSet<String>,
    },
    /// Parallel instance: per-fetch filesystem checks, so sibling
    /// processes see each other's progress without a shared preload.
    Filesystem,
}

pub struct FetchEngine {
    host: Arc<dyn ReadmeHost>,
    readmes_dir: PathBuf,
    errors_dir: PathBuf,
    branches: Vec<String>,
    min_size: usize,
    max_chars: usize,
    verbose: bool,
    skip: SkipIndex,
    /// Buckets already `mkdir`ed this process.
    created_buckets: Mutex<HashSet<String>>,
    pub stats: FetchStats,
    started: Instant,
}

enum SweepOutcome {
    Found {
        content: String,
        branch: String,
        filename: String,
    },
    Miss {
        bucket: String,
    },
}

impl FetchEngine {
    /// Build an engine rooted at the given directories, creating them if
    /// needed. `parallel_instance` switches the skip check from a
    /// preloaded set to per-fetch filesystem probes.
    pub fn new(
        host: Arc<dyn ReadmeHost>,
        readmes_dir: PathBuf,
        errors_dir: PathBuf,
        fetch_config: &FetchConfig,
        verbose: bool,
        parallel_instance: bool,
    ) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&readmes_dir)
            .with_context(|| format!("failed to create {}", readmes_dir.display()))?;
        std::fs::create_dir_all(&errors_dir)
            .with_context(|| format!("failed to create {}", errors_dir.display()))?;

        let skip = if parallel_instance {
            SkipIndex::Filesystem
        } else {
            SkipIndex::Preloaded {
                existing: scan_existing(&readmes_dir)?,
                errored: scan_errored(&errors_dir)?,
            }
        };

        Ok(Arc::new(Self {
            host,
            readmes_dir,
            errors_dir,
            branches: fetch_config.branches.clone(),
            min_size: fetch_config.min_size,
            max_chars: fetch_config.max_chars,
            verbose,
            skip,
            created_buckets: Mutex::new(HashSet::new()),
            stats: FetchStats::default(),
            started: Instant::now(),
        }))
    }

    /// Process a batch of origins with at most `concurrency` in flight.
    /// Per-origin failures are recorded, never propagated: one bad repo
    /// must not sink a 50k batch.
    pub async fn run(
        self: Arc<Self>,
        origins: Vec<Origin>,
        concurrency: usize,
        total: u64,
    ) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut tasks = JoinSet::new();

        for origin in origins {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .context("fetch semaphore closed")?;
            let engine = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                engine.process(&origin, total).await;
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                eprintln!("Warning: fetch task panicked: {}", e);
            }
        }
        Ok(())
    }

    async fn process(&self, origin: &Origin, total: u64) {
        let repo = match repo_from_origin(&origin.url) {
            Some(repo) => repo,
            None => {
                FetchStats::bump(&self.stats.failed);
                if self.verbose {
                    eprintln!("[ERR] unparseable origin: {}", origin.url);
                }
                return;
            }
        };
        let stem = repo_stem(&repo);

        if self.is_done(&stem) {
            FetchStats::bump(&self.stats.skipped);
            self.finish_one(total);
            return;
        }

        match self.sweep(&repo).await {
            SweepOutcome::Found {
                content,
                branch,
                filename,
            } => {
                self.record_content(&repo, &stem, &branch, &filename, content)
                    .await;
            }
            SweepOutcome::Miss { bucket } => {
                // The API knows the real default branch; ask it before
                // giving up on the repo.
                if let Some((filename, content)) = self.host.fetch_api_readme(&repo).await {
                    FetchStats::bump(&self.stats.api_fallbacks);
                    self.record_content(&repo, &stem, "default", &filename, content)
                        .await;
                } else {
                    FetchStats::bump(&self.stats.failed);
                    if self.verbose {
                        eprintln!("[ERR] {}: no README ({})", repo, bucket);
                    }
                    if let Err(e) = self.write_marker(&bucket, &stem) {
                        eprintln!("Warning: failed to write marker for {}: {}", repo, e);
                    }
                }
            }
        }

        self.finish_one(total);
    }

    /// Decision tree for fetched content: under-sized content gets a
    /// `tooSmall` marker, everything else is truncated if needed and
    /// written as a success artifact.
    async fn record_content(
        &self,
        repo: &str,
        stem: &str,
        branch: &str,
        filename: &str,
        content: String,
    ) {
        if content.len() < self.min_size {
            FetchStats::bump(&self.stats.too_small);
            if let Err(e) = self.write_marker(TOO_SMALL_BUCKET, stem) {
                eprintln!("Warning: failed to write marker for {}: {}", repo, e);
            }
            return;
        }
        if let Err(e) = self.save(repo, branch, filename, content).await {
            FetchStats::bump(&self.stats.failed);
            eprintln!("Warning: failed to record {}: {}", repo, e);
        }
    }

    /// Sweep the candidate space. Marker preference when nothing is
    /// found: a concrete non-404 status beats the network bucket, which
    /// beats `404_<N>` — the most actionable signal wins.
    async fn sweep(&self, repo: &str) -> SweepOutcome {
        let mut late_status: Option<u16> = None;
        let mut network_failed = false;
        let mut tested = 0usize;

        for filename in README_NAMES {
            for branch in &self.branches {
                tested += 1;
                match self.host.fetch_candidate(repo, branch, filename).await {
                    CandidateOutcome::Content(content) => {
                        return SweepOutcome::Found {
                            content,
                            branch: branch.clone(),
                            filename: (*filename).to_string(),
                        };
                    }
                    CandidateOutcome::Status(404) => {}
                    CandidateOutcome::Status(451) => {
                        return SweepOutcome::Miss {
                            bucket: "451".to_string(),
                        };
                    }
                    CandidateOutcome::Status(status) => {
                        if self.verbose {
                            eprintln!("[WARN] {}: {} for {}/{}", repo, status, branch, filename);
                        }
                        late_status = Some(status);
                    }
                    CandidateOutcome::NetworkFailed => {
                        network_failed = true;
                    }
                }
            }
        }

        let bucket = match late_status {
            Some(status) => status.to_string(),
            None if network_failed => NETWORK_BUCKET.to_string(),
            None => format!("404_{}", tested),
        };
        SweepOutcome::Miss { bucket }
    }

    async fn save(&self, repo: &str, branch: &str, filename: &str, content: String) -> Result<()> {
        let name = readme_file_name(repo, branch, filename);
        if name.len() > MAX_FILE_NAME_BYTES {
            FetchStats::bump(&self.stats.skipped);
            if self.verbose {
                eprintln!("[WARN] {}: artifact name over {} bytes", repo, MAX_FILE_NAME_BYTES);
            }
            return Ok(());
        }

        let body = if content.chars().count() > self.max_chars {
            FetchStats::bump(&self.stats.truncated);
            let mut truncated = truncate_chars(&content, self.max_chars).to_string();
            truncated.push_str(TRUNCATION_MARKER);
            truncated
        } else {
            content
        };

        tokio::fs::write(self.readmes_dir.join(&name), body).await?;
        FetchStats::bump(&self.stats.success);
        Ok(())
    }

    fn write_marker(&self, bucket: &str, stem: &str) -> Result<()> {
        let dir = self.errors_dir.join(bucket);
        {
            let mut created = self
                .created_buckets
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if created.insert(bucket.to_string()) {
                std::fs::create_dir_all(&dir)?;
            }
        }
        std::fs::write(dir.join(stem), b"")?;
        Ok(())
    }

    fn is_done(&self, stem: &str) -> bool {
        match &self.skip {
            SkipIndex::Preloaded { existing, errored } => {
                existing.contains(stem) || errored.contains(stem)
            }
            SkipIndex::Filesystem => {
                // Success probes assume master/main; see the skip-path
                // helper if the branch set ever widens.
                for path in self.parallel_skip_paths(stem) {
                    if path.exists() {
                        return true;
                    }
                }
                if let Ok(buckets) = std::fs::read_dir(&self.errors_dir) {
                    for bucket in buckets.flatten() {
                        if bucket.path().join(stem).exists() {
                            return true;
                        }
                    }
                }
                false
            }
        }
    }

    fn parallel_skip_paths(&self, stem: &str) -> [PathBuf; 3] {
        [
            self.readmes_dir
                .join(format!("{}_master_README.md", stem)),
            self.readmes_dir.join(format!("{}_main_README.md", stem)),
            // API-fallback artifacts land under the `default` token.
            self.readmes_dir
                .join(format!("{}_default_README.md", stem)),
        ]
    }

    fn finish_one(&self, total: u64) {
        let processed = FetchStats::bump(&self.stats.processed);
        if processed % 100 == 0 {
            let elapsed = self.started.elapsed().as_secs_f64();
            let rate = if elapsed > 0.0 {
                processed as f64 / elapsed
            } else {
                0.0
            };
            eprint!(
                "\r[{}/{}] ✓ {} ✗ {} ({:.0}/s)",
                processed,
                total,
                self.stats.success.load(Ordering::Relaxed),
                self.stats.failed.load(Ordering::Relaxed),
                rate
            );
        }
    }
}

/// Entry point for `atlas fetch`: stream origin batches from the work
/// source through the engine, committing the cursor after each batch so
/// a restart resumes where this run stopped.
pub async fn run_fetch(
    config: &Config,
    params: &WorkParams,
    proxy_files: &[PathBuf],
    verbose: bool,
) -> Result<()> {
    let pool = Arc::new(ProxyPool::load(proxy_files, config.fetch.timeout_secs)?);
    let host = Arc::new(HttpReadmeHost::new(
        pool,
        config.fetch.max_retries,
        config.fetch.timeout_secs,
        std::env::var("GITHUB_TOKEN").ok(),
    )?);

    // Sibling processes work disjoint offset slices and coordinate only
    // through the filesystem, so anything offset-sliced checks per-fetch.
    let parallel_instance = params.offset > 0;
    let engine = FetchEngine::new(
        host,
        config.readmes_dir.clone(),
        config.errors_dir(),
        &config.fetch,
        verbose,
        parallel_instance,
    )?;

    let mut source = WorkSource::open(config, params)?;
    let total = source.remaining()? as u64;
    println!(
        "Fetching {} repos (concurrency: {})...",
        total, config.fetch.concurrency
    );
    if parallel_instance {
        println!("Parallel instance at offset {}", params.offset);
    }

    while let Some(batch) = source.next_batch()? {
        let last_id = batch.last().map(|o| o.id);
        engine.clone().run(batch, config.fetch.concurrency, total).await?;
        if let Some(id) = last_id {
            source.commit(id)?;
        }
    }

    eprintln!();
    println!("Done! {}", engine.stats.summary());
    Ok(())
}

/// Stems of repos with a README already on disk.
fn scan_existing(readmes_dir: &std::path::Path) -> Result<HashSet<String>> {
    let mut existing = HashSet::new();
    for entry in std::fs::read_dir(readmes_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') {
            continue;
        }
        // The filename is the authority for owner/repo; API-fallback
        // artifacts can carry underscores in the README filename, so a
        // plain right-split is not enough here.
        if let Some((owner, repo)) = crate::models::parse_readme_file_name(&name) {
            existing.insert(format!("{}_{}", owner, repo));
        }
    }
    Ok(existing)
}

/// Stems of repos with an error marker in any bucket.
fn scan_errored(errors_dir: &std::path::Path) -> Result<HashSet<String>> {
    let mut errored = HashSet::new();
    for bucket in std::fs::read_dir(errors_dir)?.flatten() {
        if !bucket.file_type()?.is_dir() {
            continue;
        }
        for marker in std::fs::read_dir(bucket.path())?.flatten() {
            errored.insert(marker.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(errored)
}
