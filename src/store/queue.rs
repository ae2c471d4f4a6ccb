// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-entity mutation queue.
//!
//! Each entity id owns a chain of tickets. Taking a ticket is synchronous,
//! so queue order is submission order. A ticket's holder may proceed once the
//! previous ticket for the same id has been dropped; dropping a ticket
//! releases the next one. Different ids never wait on each other.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::types::StoreError;

#[derive(Default)]
struct QueueInner {
    /// Receiver the next ticket for an id must wait on, tagged with the
    /// sequence of the ticket that owns the matching sender.
    tails: Mutex<HashMap<String, (u64, oneshot::Receiver<()>)>>,
    next_seq: AtomicU64,
}

#[derive(Clone, Default)]
pub(crate) struct MutationQueue {
    inner: Arc<QueueInner>,
}

impl MutationQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Join the tail of `id`'s chain.
    pub(crate) fn enqueue(&self, id: &str) -> QueueTicket {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let (done, next) = oneshot::channel();

        let predecessor = self
            .inner
            .tails
            .lock()
            .insert(id.to_string(), (seq, next))
            .map(|(_, rx)| rx);

        QueueTicket {
            key: id.to_string(),
            seq,
            predecessor,
            done: Some(done),
            queue: self.inner.clone(),
        }
    }

    /// Number of ids with at least one live ticket.
    pub(crate) fn active_ids(&self) -> usize {
        self.inner.tails.lock().len()
    }
}

pub(crate) struct QueueTicket {
    key: String,
    seq: u64,
    predecessor: Option<oneshot::Receiver<()>>,
    done: Option<oneshot::Sender<()>>,
    queue: Arc<QueueInner>,
}

impl QueueTicket {
    /// True when no earlier ticket for the same id is outstanding.
    pub(crate) fn is_ready(&self) -> bool {
        self.predecessor.is_none()
    }

    /// Wait until every earlier ticket for the same id has been released.
    pub(crate) async fn wait(&mut self, timeout: Duration) -> Result<(), StoreError> {
        let Some(predecessor) = self.predecessor.as_mut() else {
            return Ok(());
        };

        debug!(id = %self.key, "Mutation queued behind in-flight mutation");
        // Both a send and a dropped sender mean the predecessor is finished.
        match tokio::time::timeout(timeout, predecessor).await {
            Ok(_) => {
                self.predecessor = None;
                Ok(())
            }
            Err(_) => {
                warn!(id = %self.key, timeout_ms = timeout.as_millis() as u64, "Queued mutation timed out");
                crate::metrics::record_queue_timeout();
                Err(StoreError::MutationQueueTimeout {
                    id: self.key.clone(),
                    waited_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

impl QueueInner {
    fn release(&self, key: &str, seq: u64) {
        let mut tails = self.tails.lock();
        if tails.get(key).map(|(s, _)| *s) == Some(seq) {
            tails.remove(key);
        }
    }
}

impl Drop for QueueTicket {
    fn drop(&mut self) {
        let done = self.done.take();
        match self.predecessor.take() {
            // Gave up waiting; keep the chain intact for later tickets by
            // releasing only after the predecessor itself finishes.
            Some(predecessor) => match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let queue = self.queue.clone();
                    let key = std::mem::take(&mut self.key);
                    let seq = self.seq;
                    handle.spawn(async move {
                        let _ = predecessor.await;
                        queue.release(&key, seq);
                        drop(done);
                    });
                }
                Err(_) => {
                    self.queue.release(&self.key, self.seq);
                    drop(done);
                }
            },
            None => {
                self.queue.release(&self.key, self.seq);
                drop(done);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Mutex as AsyncMutex;

    #[tokio::test]
    async fn test_first_ticket_runs_immediately() {
        let queue = MutationQueue::new();
        let mut ticket = queue.enqueue("rec1");
        ticket.wait(Duration::from_millis(10)).await.unwrap();
    }

    #[tokio::test]
    async fn test_same_id_runs_in_submission_order() {
        let queue = MutationQueue::new();
        let order = Arc::new(AsyncMutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..5 {
            let mut ticket = queue.enqueue("rec1");
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                ticket.wait(Duration::from_secs(5)).await.unwrap();
                // later tickets finish faster; order must still hold
                tokio::time::sleep(Duration::from_millis(10 * (5 - i))).await;
                order.lock().await.push(i);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock().await, vec![0, 1, 2, 3, 4]);
        assert_eq!(queue.active_ids(), 0);
    }

    #[tokio::test]
    async fn test_different_ids_do_not_wait() {
        let queue = MutationQueue::new();
        let _held = queue.enqueue("rec1");

        let mut other = queue.enqueue("rec2");
        other.wait(Duration::from_millis(10)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_keeps_chain_ordered() {
        let queue = MutationQueue::new();
        let first = queue.enqueue("rec1");

        let mut second = queue.enqueue("rec1");
        let err = second.wait(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::MutationQueueTimeout { .. }));
        drop(second);

        // third must still wait for `first`, even though `second` gave up
        let mut third = queue.enqueue("rec1");
        assert!(third.wait(Duration::from_secs(1)).await.is_err());
        drop(third);

        drop(first);
        let mut fourth = queue.enqueue("rec1");
        fourth.wait(Duration::from_secs(1)).await.unwrap();
    }
}
