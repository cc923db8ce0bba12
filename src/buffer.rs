//! Bounded producer/consumer buffer with graceful drain.
//!
//! The embed pipeline reads files faster than any embedding backend can
//! absorb them; an unbounded channel would admit OOM on a slow backend.
//! This buffer applies backpressure instead: [`AsyncBuffer::push`] blocks
//! at capacity, [`AsyncBuffer::pull`] blocks until a full batch is
//! available (or the buffer is finished), and [`AsyncBuffer::finish`]
//! flips to draining so consumers exit cleanly once empty.
//!
//! `pull` returning `None` is the termination signal: it means the buffer
//! is finished and drained.

use std::collections::VecDeque;
use tokio::sync::{Mutex, Notify};

pub struct AsyncBuffer<T> {
    state: Mutex<BufState<T>>,
    /// Wakes producers when space frees up.
    space: Notify,
    /// Wakes consumers when data arrives or the buffer finishes.
    data: Notify,
    max_size: usize,
    batch_size: usize,
}

struct BufState<T> {
    items: VecDeque<T>,
    done: bool,
}

impl<T> AsyncBuffer<T> {
    pub fn new(max_size: usize, batch_size: usize) -> Self {
        assert!(max_size > 0 && batch_size > 0);
        Self {
            state: Mutex::new(BufState {
                items: VecDeque::new(),
                done: false,
            }),
            space: Notify::new(),
            data: Notify::new(),
            max_size,
            batch_size,
        }
    }

    /// Append an item, waiting while the buffer is at capacity.
    ///
    /// Returns `false` without storing when the buffer has been finished.
    pub async fn push(&self, item: T) -> bool {
        loop {
            // Register interest before checking state so a notify between
            // the unlock and the await is not lost.
            let notified = self.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.state.lock().await;
                if st.done {
                    return false;
                }
                if st.items.len() < self.max_size {
                    st.items.push_back(item);
                    self.data.notify_waiters();
                    return true;
                }
            }
            notified.await;
        }
    }

    /// Take the next batch, waiting until at least `batch_size` items are
    /// buffered or the buffer is finished. After finish, remaining items
    /// drain in under-sized batches; `None` means finished and empty.
    pub async fn pull(&self) -> Option<Vec<T>> {
        loop {
            let notified = self.data.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.state.lock().await;
                if st.items.len() >= self.batch_size || (st.done && !st.items.is_empty()) {
                    let n = self.batch_size.min(st.items.len());
                    let batch: Vec<T> = st.items.drain(..n).collect();
                    self.space.notify_waiters();
                    return Some(batch);
                }
                if st.done {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Flip to draining: no further pushes are accepted, blocked consumers
    /// wake, and pulls return whatever remains before signalling `None`.
    pub async fn finish(&self) {
        let mut st = self.state.lock().await;
        st.done = true;
        self.data.notify_waiters();
        self.space.notify_waiters();
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn consumes_exactly_what_was_produced() {
        let buf = Arc::new(AsyncBuffer::new(8, 3));

        let producer = {
            let buf = buf.clone();
            tokio::spawn(async move {
                for i in 0..100u32 {
                    assert!(buf.push(i).await);
                }
                buf.finish().await;
            })
        };

        let mut consumed = Vec::new();
        while let Some(batch) = buf.pull().await {
            assert!(!batch.is_empty());
            assert!(batch.len() <= 3);
            consumed.extend(batch);
        }
        producer.await.unwrap();

        consumed.sort_unstable();
        assert_eq!(consumed, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn pull_after_drain_returns_none() {
        let buf = AsyncBuffer::new(4, 2);
        buf.push(1).await;
        buf.finish().await;

        // One under-sized batch drains the remainder, then termination.
        assert_eq!(buf.pull().await, Some(vec![1]));
        assert_eq!(buf.pull().await, None);
        assert_eq!(buf.pull().await, None);
    }

    #[tokio::test]
    async fn push_blocks_at_capacity() {
        let buf = Arc::new(AsyncBuffer::new(2, 1));
        assert!(buf.push(1).await);
        assert!(buf.push(2).await);

        let blocked = {
            let buf = buf.clone();
            tokio::spawn(async move { buf.push(3).await })
        };

        // The third push cannot complete while the buffer is full.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());
        assert_eq!(buf.len().await, 2);

        // Freeing one slot unblocks it.
        assert_eq!(buf.pull().await, Some(vec![1]));
        assert!(blocked.await.unwrap());
        assert_eq!(buf.len().await, 2);
    }

    #[tokio::test]
    async fn pull_waits_for_a_full_batch_until_finish() {
        let buf = Arc::new(AsyncBuffer::new(8, 3));
        buf.push(7).await;

        let pending = {
            let buf = buf.clone();
            tokio::spawn(async move { buf.pull().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        buf.finish().await;
        assert_eq!(pending.await.unwrap(), Some(vec![7]));
        assert_eq!(buf.pull().await, None);
    }

    #[tokio::test]
    async fn push_after_finish_is_rejected() {
        let buf = AsyncBuffer::new(4, 2);
        buf.finish().await;
        assert!(!buf.push(1).await);
        assert_eq!(buf.pull().await, None);
    }

    #[tokio::test]
    async fn many_consumers_observe_termination() {
        let buf = Arc::new(AsyncBuffer::new(8, 2));
        let mut consumers = Vec::new();
        for _ in 0..4 {
            let buf = buf.clone();
            consumers.push(tokio::spawn(async move {
                let mut count = 0usize;
                while let Some(batch) = buf.pull().await {
                    count += batch.len();
                }
                count
            }));
        }

        for i in 0..50 {
            buf.push(i).await;
        }
        buf.finish().await;

        let mut total = 0;
        for c in consumers {
            total += c.await.unwrap();
        }
        assert_eq!(total, 50);
    }
}
