//! Vector store abstraction.
//!
//! The [`VectorStore`] trait covers the four operations the pipeline
//! needs from a vector database: idempotent collection bootstrap, an
//! existing-ID scan (the source of truth for "already embedded"),
//! chunked upserts, and a point count for stats. Implementations must be
//! `Send + Sync`; the drivers hold them behind `Arc<dyn VectorStore>`.
//!
//! Backends:
//! - [`qdrant::QdrantStore`] — the production adapter over Qdrant's REST API.
//! - [`memory::MemoryStore`] — an in-process map for tests.

pub mod memory;
pub mod qdrant;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// Vector DB payload cap per upsert call.
pub const UPSERT_CHUNK: usize = 100;

/// Payload stored with every point. Full content is deliberately absent:
/// it is retrievable externally from the hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointPayload {
    pub repo_name: String,
    pub content_hash: String,
}

/// A vector plus identity and payload, ready for upsert.
#[derive(Debug, Clone)]
pub struct Point {
    pub id: Uuid,
    pub vector: Vec<f32>,
    pub payload: PointPayload,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create the collection (and its `repo_name` keyword index) if absent.
    async fn ensure_collection(&self) -> Result<()>;

    /// All point IDs currently in the collection.
    async fn existing_ids(&self) -> Result<HashSet<Uuid>>;

    /// Upsert points, chunked to [`UPSERT_CHUNK`] per call. With
    /// `wait = false` the call returns without waiting for server-side
    /// indexing.
    async fn upsert(&self, points: &[Point], wait: bool) -> Result<()>;

    /// Exact point count.
    async fn count(&self) -> Result<u64>;
}
