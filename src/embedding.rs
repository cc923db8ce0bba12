//! Realtime embedding providers.
//!
//! Two wire shapes live behind one entry point, [`embed_realtime`]:
//!
//! - **OpenAI-style** (Nebius): `POST {model, input, dimensions}` →
//!   `{data: [{embedding, index}], usage: {prompt_tokens}}`. Embeddings
//!   are reordered by `index`, so provider-side reordering is safe.
//! - **DeepInfra-style**: `POST {inputs, normalize: false, dimensions}` →
//!   `{embeddings, input_tokens, inference_status: {cost}}`.
//!
//! # Retry
//!
//! Up to [`EMBED_MAX_ATTEMPTS`] attempts for 429, 5xx, and network
//! errors, with a linear backoff of `2 s × attempt` (4 s before the
//! second attempt, 20 s before the tenth) capped at 20 s. A 402
//! maps to [`BudgetExhausted`] and is never retried: the budget is spent
//! and the orchestrator should stop gracefully. Any other 4xx is terminal
//! for the sub-batch.
//!
//! # Keys
//!
//! `KeyRing` rotates round-robin over N keys loaded from
//! `<PROVIDER>_API_KEY`, `<PROVIDER>_API_KEY_1`, … so a single run can
//! spread load across accounts.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::models::BudgetExhausted;

/// Attempts per sub-batch before giving up on transient failures.
pub const EMBED_MAX_ATTEMPTS: u32 = 10;

const BACKOFF_STEP_SECS: u64 = 2;
const BACKOFF_CAP_SECS: u64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    DeepInfra,
    Nebius,
    /// Nebius through the asynchronous batch endpoint.
    NebiusBatch,
}

impl Provider {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "deepinfra" => Ok(Self::DeepInfra),
            "nebius" => Ok(Self::Nebius),
            "nebius-batch" => Ok(Self::NebiusBatch),
            other => bail!(
                "unknown provider: '{}' (expected deepinfra, nebius, or nebius-batch)",
                other
            ),
        }
    }

    /// Whether this provider runs through the submit/poll/download driver.
    pub fn is_batch(&self) -> bool {
        matches!(self, Self::NebiusBatch)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::DeepInfra => "deepinfra",
            Self::Nebius => "nebius",
            Self::NebiusBatch => "nebius-batch",
        }
    }

    /// Env-var prefix for API keys.
    pub fn key_prefix(&self) -> &'static str {
        match self {
            Self::DeepInfra => "DEEPINFRA",
            Self::Nebius | Self::NebiusBatch => "NEBIUS",
        }
    }

    pub fn model(&self) -> &'static str {
        "Qwen/Qwen3-Embedding-8B"
    }

    pub fn realtime_url(&self) -> String {
        match self {
            Self::DeepInfra => format!("https://api.deepinfra.com/v1/inference/{}", self.model()),
            Self::Nebius | Self::NebiusBatch => {
                "https://api.studio.nebius.com/v1/embeddings".to_string()
            }
        }
    }

    /// Base URL for the asynchronous batch API (`/files`, `/batches`).
    pub fn batch_base_url(&self) -> &'static str {
        "https://api.studio.nebius.com/v1"
    }
}

/// Round-robin API key rotation.
pub struct KeyRing {
    keys: Vec<String>,
    cursor: AtomicUsize,
}

impl KeyRing {
    /// Load `count` keys for the provider: `<PREFIX>_API_KEY`, then
    /// `<PREFIX>_API_KEY_1` … `<PREFIX>_API_KEY_<count-1>`.
    pub fn from_env(provider: Provider, count: usize) -> Result<Self> {
        let prefix = provider.key_prefix();
        let mut keys = Vec::with_capacity(count);
        for i in 0..count {
            let name = if i == 0 {
                format!("{}_API_KEY", prefix)
            } else {
                format!("{}_API_KEY_{}", prefix, i)
            };
            let key = std::env::var(&name)
                .with_context(|| format!("missing environment variable {}", name))?;
            keys.push(key);
        }
        Ok(Self::new(keys))
    }

    pub fn new(keys: Vec<String>) -> Self {
        Self {
            keys,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Next key in rotation.
    pub fn next(&self) -> &str {
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % self.keys.len();
        &self.keys[i]
    }
}

/// Result of one realtime embedding call.
#[derive(Debug)]
pub struct EmbedResponse {
    /// One vector per input text, in input order.
    pub embeddings: Vec<Vec<f32>>,
    /// Prompt tokens consumed.
    pub tokens: u64,
    /// Dollar cost: provider-reported when available, otherwise
    /// token-derived.
    pub cost: f64,
}

// ── OpenAI-style (Nebius) wire types ──────────────────────────

#[derive(Deserialize)]
struct OpenAiResponse {
    data: Vec<OpenAiDatum>,
    usage: OpenAiUsage,
}

#[derive(Deserialize)]
struct OpenAiDatum {
    embedding: Vec<f32>,
    index: usize,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u64,
}

// ── DeepInfra wire types ──────────────────────────────────────

#[derive(Deserialize)]
struct DeepInfraResponse {
    embeddings: Vec<Vec<f32>>,
    input_tokens: u64,
    inference_status: DeepInfraStatus,
}

#[derive(Deserialize)]
struct DeepInfraStatus {
    cost: f64,
}

/// Embed a batch of texts through the provider's realtime endpoint.
pub async fn embed_realtime(
    client: &reqwest::Client,
    provider: Provider,
    keys: &KeyRing,
    dims: usize,
    texts: &[String],
    price_per_mtok: f64,
) -> Result<EmbedResponse> {
    let url = provider.realtime_url();
    let body = match provider {
        Provider::DeepInfra => serde_json::json!({
            "inputs": texts,
            "normalize": false,
            "dimensions": dims,
        }),
        Provider::Nebius | Provider::NebiusBatch => serde_json::json!({
            "model": provider.model(),
            "input": texts,
            "dimensions": dims,
        }),
    };

    let mut last_err = None;
    for attempt in 1..=EMBED_MAX_ATTEMPTS {
        if attempt > 1 {
            tokio::time::sleep(Duration::from_secs(backoff_delay_secs(attempt))).await;
        }

        let resp = client
            .post(&url)
            .header("Authorization", format!("Bearer {}", keys.next()))
            .json(&body)
            .send()
            .await;

        match resp {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    let text = response.text().await?;
                    return parse_response(provider, &text, price_per_mtok);
                }

                if status.as_u16() == 402 {
                    return Err(anyhow::Error::new(BudgetExhausted));
                }

                if status.as_u16() == 429 || status.is_server_error() {
                    let text = response.text().await.unwrap_or_default();
                    last_err = Some(anyhow::anyhow!("embedding API error {}: {}", status, text));
                    continue;
                }

                // Other client errors are terminal for this sub-batch.
                let text = response.text().await.unwrap_or_default();
                bail!("embedding API error {}: {}", status, text);
            }
            Err(e) => {
                last_err = Some(e.into());
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("embedding failed after retries")))
}

/// Backoff before the given (1-based) attempt: `2 s × attempt`, capped.
fn backoff_delay_secs(attempt: u32) -> u64 {
    (BACKOFF_STEP_SECS * u64::from(attempt)).min(BACKOFF_CAP_SECS)
}

fn parse_response(provider: Provider, text: &str, price_per_mtok: f64) -> Result<EmbedResponse> {
    match provider {
        Provider::DeepInfra => parse_deepinfra_response(text),
        Provider::Nebius | Provider::NebiusBatch => parse_openai_response(text, price_per_mtok),
    }
}

/// Parse an OpenAI-shaped response, restoring input order by `index`.
fn parse_openai_response(text: &str, price_per_mtok: f64) -> Result<EmbedResponse> {
    let mut parsed: OpenAiResponse =
        serde_json::from_str(text).context("bad OpenAI-shaped embedding response")?;
    parsed.data.sort_by_key(|d| d.index);
    let tokens = parsed.usage.prompt_tokens;
    Ok(EmbedResponse {
        embeddings: parsed.data.into_iter().map(|d| d.embedding).collect(),
        tokens,
        cost: tokens as f64 / 1_000_000.0 * price_per_mtok,
    })
}

fn parse_deepinfra_response(text: &str) -> Result<EmbedResponse> {
    let parsed: DeepInfraResponse =
        serde_json::from_str(text).context("bad DeepInfra embedding response")?;
    Ok(EmbedResponse {
        embeddings: parsed.embeddings,
        tokens: parsed.input_tokens,
        cost: parsed.inference_status.cost,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_parse_round_trip() {
        for name in ["deepinfra", "nebius", "nebius-batch"] {
            assert_eq!(Provider::parse(name).unwrap().name(), name);
        }
        assert!(Provider::parse("openai").is_err());
    }

    #[test]
    fn batch_flag_only_on_batch_provider() {
        assert!(Provider::NebiusBatch.is_batch());
        assert!(!Provider::Nebius.is_batch());
        assert!(!Provider::DeepInfra.is_batch());
    }

    #[test]
    fn backoff_grows_linearly_and_hits_the_cap_on_the_last_attempt() {
        assert_eq!(backoff_delay_secs(2), 4);
        assert_eq!(backoff_delay_secs(5), 10);
        assert_eq!(backoff_delay_secs(EMBED_MAX_ATTEMPTS), 20);
        // Anything past the cap stays clamped.
        assert_eq!(backoff_delay_secs(EMBED_MAX_ATTEMPTS + 5), 20);
    }

    #[test]
    fn key_ring_round_robin() {
        let ring = KeyRing::new(vec!["a".into(), "b".into(), "c".into()]);
        let picked: Vec<&str> = (0..6).map(|_| ring.next()).collect();
        assert_eq!(picked, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn openai_response_restores_index_order() {
        let text = r#"{
            "data": [
                {"embedding": [2.0], "index": 1},
                {"embedding": [1.0], "index": 0},
                {"embedding": [3.0], "index": 2}
            ],
            "usage": {"prompt_tokens": 2000000}
        }"#;
        let resp = parse_openai_response(text, 0.01).unwrap();
        assert_eq!(resp.embeddings, vec![vec![1.0], vec![2.0], vec![3.0]]);
        assert_eq!(resp.tokens, 2_000_000);
        assert!((resp.cost - 0.02).abs() < 1e-12);
    }

    #[test]
    fn deepinfra_response_carries_reported_cost() {
        let text = r#"{
            "embeddings": [[0.5, 0.5], [0.25, 0.75]],
            "input_tokens": 1234,
            "inference_status": {"cost": 0.00042}
        }"#;
        let resp = parse_deepinfra_response(text).unwrap();
        assert_eq!(resp.embeddings.len(), 2);
        assert_eq!(resp.tokens, 1234);
        assert!((resp.cost - 0.00042).abs() < 1e-12);
    }

    #[test]
    fn malformed_response_is_an_error() {
        assert!(parse_openai_response("{}", 0.01).is_err());
        assert!(parse_deepinfra_response("not json").is_err());
    }
}
