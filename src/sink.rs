//! Asynchronous batching write path to the document index.
//!
//! Producers enqueue documents through a cloneable [`BulkHandle`]. One
//! background task groups whatever is queued into batches and keeps at most
//! `workers` batches in flight. Every item carries the [`WriteTracker`] of
//! the period that produced it, so a period can wait for its own writes and
//! see whether any failed.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, warn};

use crate::index::{BulkItem, DocumentIndex};

#[derive(Debug, Error)]
#[error("bulk sink is closed")]
pub struct SinkClosed;

/// Outstanding and failed writes for one unit of work.
#[derive(Debug)]
pub struct WriteTracker {
    pending: watch::Sender<usize>,
    failed: AtomicUsize,
}

impl Default for WriteTracker {
    fn default() -> Self {
        Self {
            pending: watch::Sender::new(0),
            failed: AtomicUsize::new(0),
        }
    }
}

impl WriteTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn submitted(&self) {
        self.pending.send_modify(|n| *n += 1);
    }

    fn completed(&self, ok: bool) {
        if !ok {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.pending.send_modify(|n| *n = n.saturating_sub(1));
    }

    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::Relaxed)
    }

    /// Wait until every submitted document has been acknowledged or
    /// rejected. Returns the number of rejected documents.
    pub async fn settled(&self) -> usize {
        let mut rx = self.pending.subscribe();
        // The sender lives in `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|n| *n == 0).await;
        self.failed()
    }
}

struct Queued {
    item: BulkItem,
    tracker: Arc<WriteTracker>,
}

#[derive(Debug, Clone, Copy)]
pub struct BulkOptions {
    /// Upper bound on documents per bulk request.
    pub bulk_actions: usize,
    /// Bulk requests in flight at once.
    pub workers: usize,
    /// Queue depth before producers wait.
    pub capacity: usize,
}

impl Default for BulkOptions {
    fn default() -> Self {
        Self {
            bulk_actions: 1000,
            workers: 2,
            capacity: 10_000,
        }
    }
}

/// Totals over the life of a sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkStats {
    pub batches: u64,
    pub documents: u64,
    pub failed_documents: u64,
}

#[derive(Clone)]
pub struct BulkHandle {
    tx: mpsc::Sender<Queued>,
}

impl BulkHandle {
    /// Queue one serialized document for `index`. Waits when the queue is
    /// full.
    pub async fn add(
        &self,
        index: &str,
        source: String,
        tracker: &Arc<WriteTracker>,
    ) -> Result<(), SinkClosed> {
        tracker.submitted();
        let queued = Queued {
            item: BulkItem {
                index: index.to_string(),
                source,
            },
            tracker: Arc::clone(tracker),
        };
        if self.tx.send(queued).await.is_err() {
            tracker.completed(false);
            return Err(SinkClosed);
        }
        Ok(())
    }
}

pub struct BulkSink {
    handle: BulkHandle,
    worker: JoinHandle<BulkStats>,
}

impl BulkSink {
    pub fn start(index: Arc<dyn DocumentIndex>, options: BulkOptions) -> Self {
        let (tx, rx) = mpsc::channel(options.capacity.max(1));
        let worker = tokio::spawn(run(index, rx, options));
        Self {
            handle: BulkHandle { tx },
            worker,
        }
    }

    pub fn handle(&self) -> BulkHandle {
        self.handle.clone()
    }

    /// Stop accepting documents, send everything still queued and return the
    /// totals. Only completes once every `BulkHandle` clone is dropped.
    pub async fn close(self) -> BulkStats {
        drop(self.handle);
        match self.worker.await {
            Ok(stats) => stats,
            Err(e) => {
                error!(error = %e, "Bulk worker task failed");
                BulkStats::default()
            }
        }
    }
}

async fn run(
    index: Arc<dyn DocumentIndex>,
    rx: mpsc::Receiver<Queued>,
    options: BulkOptions,
) -> BulkStats {
    let next_id = AtomicU64::new(1);
    ReceiverStream::new(rx)
        .ready_chunks(options.bulk_actions.max(1))
        .map(|batch| {
            let id = next_id.fetch_add(1, Ordering::Relaxed);
            commit(Arc::clone(&index), id, batch)
        })
        .buffer_unordered(options.workers.max(1))
        .fold(BulkStats::default(), |mut stats, (docs, failed)| async move {
            stats.batches += 1;
            stats.documents += docs as u64;
            stats.failed_documents += failed as u64;
            stats
        })
        .await
}

/// Send one batch; returns (documents, failed documents).
async fn commit(index: Arc<dyn DocumentIndex>, id: u64, batch: Vec<Queued>) -> (usize, usize) {
    let (items, trackers): (Vec<BulkItem>, Vec<Arc<WriteTracker>>) =
        batch.into_iter().map(|q| (q.item, q.tracker)).unzip();
    let docs = items.len();
    match index.bulk(&items).await {
        Ok(outcome) => {
            for (pos, tracker) in trackers.iter().enumerate() {
                tracker.completed(!outcome.failed.contains(&pos));
            }
            if outcome.failed.is_empty() {
                debug!(id, docs, "Documents committed");
            } else {
                warn!(
                    id,
                    docs,
                    failed = outcome.failed.len(),
                    error = outcome.first_error.as_deref().unwrap_or(""),
                    "Bulk index rejected documents"
                );
            }
            (docs, outcome.failed.len())
        }
        Err(e) => {
            for tracker in &trackers {
                tracker.completed(false);
            }
            error!(id, docs, error = %e, "Bulk index error");
            (docs, docs)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::Value;

    use super::*;
    use crate::index::{BulkOutcome, IndexError};

    /// Records batch sizes; rejects every document whose source is `"bad"`.
    #[derive(Default)]
    struct Recorder {
        batches: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl DocumentIndex for Recorder {
        async fn index_exists(&self, _: &str) -> Result<bool, IndexError> {
            Ok(true)
        }
        async fn delete_index(&self, _: &str) -> Result<(), IndexError> {
            Ok(())
        }
        async fn create_index(&self, _: &str, _: &Value) -> Result<(), IndexError> {
            Ok(())
        }
        async fn bulk(&self, items: &[BulkItem]) -> Result<BulkOutcome, IndexError> {
            self.batches.lock().unwrap().push(items.len());
            let failed: Vec<usize> = items
                .iter()
                .enumerate()
                .filter(|(_, i)| i.source == "bad")
                .map(|(pos, _)| pos)
                .collect();
            Ok(BulkOutcome {
                first_error: (!failed.is_empty()).then(|| "rejected".to_string()),
                failed,
            })
        }
        async fn get_field(&self, _: &str, _: &str, _: &str) -> Result<Option<String>, IndexError> {
            Ok(None)
        }
        async fn put_document(&self, _: &str, _: &str, _: &Value) -> Result<(), IndexError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn batches_are_capped_and_failures_tracked_per_period() {
        let index = Arc::new(Recorder::default());
        let sink = BulkSink::start(
            Arc::clone(&index) as Arc<dyn DocumentIndex>,
            BulkOptions {
                bulk_actions: 3,
                workers: 2,
                capacity: 4,
            },
        );
        let handle = sink.handle();
        let clean = WriteTracker::new();
        let dirty = WriteTracker::new();

        for i in 0..7 {
            handle.add("a", format!("{{\"n\":{i}}}"), &clean).await.unwrap();
        }
        handle.add("b", "bad".into(), &dirty).await.unwrap();
        handle.add("b", "{}".into(), &dirty).await.unwrap();

        assert_eq!(clean.settled().await, 0);
        assert_eq!(dirty.settled().await, 1);
        assert_eq!(clean.pending(), 0);

        drop(handle);
        let stats = sink.close().await;
        assert_eq!(stats.documents, 9);
        assert_eq!(stats.failed_documents, 1);
        let batches = index.batches.lock().unwrap().clone();
        assert!(batches.iter().all(|n| *n <= 3), "{batches:?}");
        assert_eq!(batches.iter().sum::<usize>(), 9);
        assert_eq!(stats.batches, batches.len() as u64);
    }

    #[tokio::test]
    async fn settled_without_writes_returns_immediately() {
        let tracker = WriteTracker::new();
        assert_eq!(tracker.settled().await, 0);
    }
}
