//! # readme-atlas
//!
//! **Builds and maintains a semantic-search index over GitHub repository
//! READMEs.**
//!
//! The pipeline pulls origin URLs from a public archive snapshot, fetches
//! each repository's README from raw hosting through a latency-scored
//! proxy pool, embeds unique READMEs through a third-party embedding API,
//! and upserts vectors into Qdrant keyed by content hash.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌─────────────┐   ┌──────────────────┐
//! │ Work Source  │──▶│ Fetch Engine │──▶│ README files +    │
//! │ parquet+duck │   │ proxy + retry│   │ error markers     │
//! └──────────────┘   └─────────────┘   └────────┬─────────┘
//!                                               │
//!                    ┌──────────────┐   ┌───────▼─────────┐
//!                    │ Embed Driver │◀──│ Item Loader      │
//!                    │ realtime/batch│  │ hash + dedup     │
//!                    └──────┬───────┘   └─────────────────┘
//!                           ▼
//!                    ┌──────────────┐
//!                    │    Qdrant    │
//!                    └──────────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. The **work source** ([`origins`]) streams origin URLs from the
//!    parquet archives in 50k batches, with a DuckDB-persisted cursor.
//! 2. The **fetch engine** ([`fetch`]) resolves which README exists for
//!    each repo across a small candidate space, retries with backoff,
//!    rotates proxies ([`proxy`]), and records every outcome durably —
//!    a restart never re-attempts completed work.
//! 3. The **item loader** ([`items`]) hashes fetched READMEs,
//!    de-duplicates by content, and skips everything already indexed.
//! 4. An **embed driver** turns items into vectors: the realtime worker
//!    pool ([`realtime`]) behind a bounded buffer ([`buffer`]), or the
//!    asynchronous submit/poll/download driver ([`batch`]) with crash
//!    recovery through the batch-state store ([`batch_state`]).
//! 5. Vectors land in the **vector store** ([`store`]) with payload
//!    `{repo_name, content_hash}`; the point ID is a pure function of
//!    the content hash, so identical READMEs collapse to one point.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Environment-driven configuration with validation |
//! | [`models`] | Core types: origins, items, ID derivation, filename codec |
//! | [`proxy`] | Proxy pool: EMA latency scoring, power-of-two-choices |
//! | [`fetch`] | Fetch engine: candidate sweep, retry, durable outcomes |
//! | [`origins`] | Work source over the parquet archives with cursors |
//! | [`items`] | Item loader: bounded reads, hashing, dedup |
//! | [`buffer`] | Bounded producer/consumer buffer with backpressure |
//! | [`embedding`] | Realtime providers, key rotation, retry policy |
//! | [`realtime`] | Realtime embed driver: worker pool, batch packing |
//! | [`batch`] | Batch embed driver: submit/poll/download, resume |
//! | [`batch_state`] | Durable batch-ID → item-metadata store |
//! | [`store`] | Vector store trait, Qdrant REST adapter, memory backend |
//! | [`progress`] | Counter aggregation and worker status lines |
//! | [`ingest`] | Orchestrator: outer chunk loop, cost estimate, dispatch |
//! | [`stats`] | Index health counts |

pub mod batch;
pub mod batch_state;
pub mod buffer;
pub mod config;
pub mod embedding;
pub mod fetch;
pub mod ingest;
pub mod items;
pub mod models;
pub mod origins;
pub mod progress;
pub mod proxy;
pub mod realtime;
pub mod stats;
pub mod store;
