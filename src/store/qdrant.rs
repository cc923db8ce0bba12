//! Qdrant adapter over its REST API.
//!
//! Hand-built requests with typed response envelopes; no SDK. The
//! collection is bootstrapped idempotently with cosine distance and a
//! keyword payload index on `repo_name`. The existing-ID scan pages
//! through `points/scroll` with payloads and vectors omitted, so even a
//! multi-million-point collection scans cheaply.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use uuid::Uuid;

use super::{Point, VectorStore, UPSERT_CHUNK};

/// Page size for the existing-ID scroll.
const SCROLL_PAGE: usize = 1000;

pub struct QdrantStore {
    http: reqwest::Client,
    base_url: String,
    collection: String,
    dims: usize,
}

#[derive(Deserialize)]
struct ScrollEnvelope {
    result: ScrollResult,
}

#[derive(Deserialize)]
struct ScrollResult {
    points: Vec<ScrolledPoint>,
    next_page_offset: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ScrolledPoint {
    id: Uuid,
}

#[derive(Deserialize)]
struct CountEnvelope {
    result: CountResult,
}

#[derive(Deserialize)]
struct CountResult {
    count: u64,
}

impl QdrantStore {
    pub fn new(base_url: &str, collection: &str, dims: usize) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(60))
                .build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            collection: collection.to_string(),
            dims,
        })
    }

    fn collection_url(&self) -> String {
        format!("{}/collections/{}", self.base_url, self.collection)
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn ensure_collection(&self) -> Result<()> {
        let resp = self.http.get(self.collection_url()).send().await?;
        if resp.status().is_success() {
            return Ok(());
        }
        if resp.status().as_u16() != 404 {
            bail!(
                "unexpected status {} checking collection {}",
                resp.status(),
                self.collection
            );
        }

        let body = serde_json::json!({
            "vectors": { "size": self.dims, "distance": "Cosine" }
        });
        let resp = self
            .http
            .put(self.collection_url())
            .json(&body)
            .send()
            .await
            .context("failed to create collection")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("collection create returned {}: {}", status, text);
        }

        // Keyword index on repo_name, created once with the collection.
        let index_body = serde_json::json!({
            "field_name": "repo_name",
            "field_schema": "keyword"
        });
        let resp = self
            .http
            .put(format!("{}/index", self.collection_url()))
            .json(&index_body)
            .send()
            .await
            .context("failed to create payload index")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("payload index create returned {}: {}", status, text);
        }

        Ok(())
    }

    async fn existing_ids(&self) -> Result<HashSet<Uuid>> {
        let mut ids = HashSet::new();
        let mut offset: Option<serde_json::Value> = None;

        loop {
            let mut body = serde_json::json!({
                "limit": SCROLL_PAGE,
                "with_payload": false,
                "with_vector": false,
            });
            if let Some(ref off) = offset {
                body["offset"] = off.clone();
            }

            let resp = self
                .http
                .post(format!("{}/points/scroll", self.collection_url()))
                .json(&body)
                .send()
                .await
                .context("scroll request failed")?;
            if !resp.status().is_success() {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                bail!("scroll returned {}: {}", status, text);
            }

            let envelope: ScrollEnvelope = resp.json().await.context("bad scroll response")?;
            for point in envelope.result.points {
                ids.insert(point.id);
            }
            match envelope.result.next_page_offset {
                Some(next) if !next.is_null() => offset = Some(next),
                _ => break,
            }
        }

        Ok(ids)
    }

    async fn upsert(&self, points: &[Point], wait: bool) -> Result<()> {
        for chunk in points.chunks(UPSERT_CHUNK) {
            let body = serde_json::json!({
                "points": chunk
                    .iter()
                    .map(|p| {
                        serde_json::json!({
                            "id": p.id,
                            "vector": p.vector,
                            "payload": p.payload,
                        })
                    })
                    .collect::<Vec<_>>()
            });

            let resp = self
                .http
                .put(format!("{}/points?wait={}", self.collection_url(), wait))
                .json(&body)
                .send()
                .await
                .context("upsert request failed")?;
            if !resp.status().is_success() {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                bail!("upsert returned {}: {}", status, text);
            }
        }
        Ok(())
    }

    async fn count(&self) -> Result<u64> {
        let resp = self
            .http
            .post(format!("{}/points/count", self.collection_url()))
            .json(&serde_json::json!({ "exact": true }))
            .send()
            .await
            .context("count request failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("count returned {}: {}", status, text);
        }
        let envelope: CountEnvelope = resp.json().await.context("bad count response")?;
        Ok(envelope.result.count)
    }
}
