//! Progress aggregation for the embed drivers.
//!
//! Workers feed one shared [`Progress`] per pipeline run; it owns the
//! counters (items, tokens, cost) and emits status lines on stderr so
//! stdout stays parseable. One line per recorded sub-batch:
//!
//! ```text
//! [realtime] 12800/50000 | 41.3 items/s | 8.2M tok | $0.08
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

pub struct Progress {
    tag: String,
    total: u64,
    count: AtomicU64,
    tokens: AtomicU64,
    cost: Mutex<f64>,
    started: Instant,
}

impl Progress {
    pub fn new(tag: &str, total: u64) -> Self {
        Self {
            tag: tag.to_string(),
            total,
            count: AtomicU64::new(0),
            tokens: AtomicU64::new(0),
            cost: Mutex::new(0.0),
            started: Instant::now(),
        }
    }

    /// Fold in one completed sub-batch and emit a status line.
    pub fn record(&self, items: u64, tokens: u64, cost: f64) {
        self.count.fetch_add(items, Ordering::Relaxed);
        self.tokens.fetch_add(tokens, Ordering::Relaxed);
        {
            let mut total_cost = self
                .cost
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *total_cost += cost;
        }
        eprintln!("{}", self.line());
    }

    /// `(items, tokens, cost)` so far.
    pub fn snapshot(&self) -> (u64, u64, f64) {
        let cost = *self
            .cost
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        (
            self.count.load(Ordering::Relaxed),
            self.tokens.load(Ordering::Relaxed),
            cost,
        )
    }

    fn line(&self) -> String {
        let (count, tokens, cost) = self.snapshot();
        let elapsed = self.started.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 {
            count as f64 / elapsed
        } else {
            0.0
        };
        format!(
            "[{}] {}/{} | {:.1} items/s | {:.1}M tok | ${:.2}",
            self.tag,
            count,
            self.total,
            rate,
            tokens as f64 / 1_000_000.0,
            cost
        )
    }
}
