//! Buffered indexer wrapping the search engine client
//!
//! Live event handlers enqueue documents here; batches go out when the
//! buffer reaches `batch_size` or when the background flusher wakes up with
//! a non-empty buffer. A failed batch is dropped and error-counted rather
//! than retried: live handlers re-emit corrections, and the sync manager has
//! its own retry policy for bulk ingestion.

use crate::document::MessageDocument;
use crate::search_client::{BatchOutcome, SearchHttpClient};
use crate::types::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Destination for document batches. Implemented by the real search client;
/// tests substitute a recording sink.
#[async_trait]
pub trait BatchSink: Send + Sync + 'static {
    async fn upsert_batch(&self, docs: Vec<MessageDocument>) -> Result<BatchOutcome>;
}

#[async_trait]
impl BatchSink for SearchHttpClient {
    async fn upsert_batch(&self, docs: Vec<MessageDocument>) -> Result<BatchOutcome> {
        SearchHttpClient::upsert_batch(self, &docs).await
    }
}

/// Snapshot of indexer counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexerStats {
    pub buffered: u64,
    pub flushed: u64,
    pub batches: u64,
    pub errors: u64,
    pub buffer_size: usize,
}

struct BufferState {
    buffer: Vec<MessageDocument>,
    buffered: u64,
    flushed: u64,
    batches: u64,
    errors: u64,
}

struct Inner {
    sink: Arc<dyn BatchSink>,
    state: Mutex<BufferState>,
    batch_size: usize,
    stop_tx: watch::Sender<bool>,
    flusher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Thread-safe buffering front for the search engine.
#[derive(Clone)]
pub struct BufferedIndexer {
    inner: Arc<Inner>,
}

impl BufferedIndexer {
    pub fn new(sink: Arc<dyn BatchSink>, batch_size: usize, flush_interval: f64) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let indexer = Self {
            inner: Arc::new(Inner {
                sink,
                state: Mutex::new(BufferState {
                    buffer: Vec::new(),
                    buffered: 0,
                    flushed: 0,
                    batches: 0,
                    errors: 0,
                }),
                batch_size: batch_size.max(1),
                stop_tx,
                flusher: std::sync::Mutex::new(None),
            }),
        };

        let handle = tokio::spawn(Self::flush_worker(
            indexer.clone(),
            Duration::from_secs_f64(flush_interval.max(0.05)),
            stop_rx,
        ));
        if let Ok(mut slot) = indexer.inner.flusher.lock() {
            *slot = Some(handle);
        }

        info!(batch_size, flush_interval, "buffered indexer initialized");
        indexer
    }

    /// Background loop: flush on a timer whenever the buffer is non-empty.
    async fn flush_worker(indexer: BufferedIndexer, interval: Duration, mut stop_rx: watch::Receiver<bool>) {
        debug!("flush worker started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
            }

            let batch = {
                let mut state = indexer.inner.state.lock().await;
                if state.buffer.is_empty() {
                    continue;
                }
                std::mem::take(&mut state.buffer)
            };
            if let Err(e) = indexer.send_batch(batch).await {
                error!("periodic flush failed: {}", e);
            }
        }
        debug!("flush worker stopped");
    }

    /// Enqueue one document. Returns after appending to the buffer; when the
    /// size threshold is hit, the drained batch is sent on a spawned task so
    /// the caller never waits on network I/O.
    pub async fn upsert(&self, doc: MessageDocument) {
        let drained = {
            let mut state = self.inner.state.lock().await;
            state.buffer.push(doc);
            state.buffered += 1;
            if state.buffer.len() >= self.inner.batch_size {
                debug!(
                    threshold = self.inner.batch_size,
                    "buffer size threshold reached, flushing"
                );
                Some(std::mem::take(&mut state.buffer))
            } else {
                None
            }
        };

        if let Some(batch) = drained {
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.send_batch(batch).await {
                    error!("size-triggered flush failed: {}", e);
                }
            });
        }
    }

    /// Hand one batch to the sink and account for the outcome. The mutex is
    /// never held across the network call.
    async fn send_batch(&self, batch: Vec<MessageDocument>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let len = batch.len() as u64;

        match self.inner.sink.upsert_batch(batch).await {
            Ok(outcome) => {
                let mut state = self.inner.state.lock().await;
                state.flushed += outcome.indexed_count;
                state.batches += 1;
                if outcome.failed_count > 0 {
                    state.errors += outcome.failed_count;
                    warn!(
                        failed = outcome.failed_count,
                        errors = ?outcome.errors,
                        "batch flush had failures"
                    );
                }
                debug!(indexed = outcome.indexed_count, "flushed batch");
                Ok(())
            }
            Err(e) => {
                let mut state = self.inner.state.lock().await;
                state.errors += len;
                error!(dropped = len, "failed to flush batch: {}", e);
                Err(e)
            }
        }
    }

    /// Blocking drain: returns after the current buffer contents have been
    /// acknowledged by the engine. An empty buffer is a no-op with no RPC.
    pub async fn flush(&self) -> Result<()> {
        let batch = {
            let mut state = self.inner.state.lock().await;
            std::mem::take(&mut state.buffer)
        };
        if batch.is_empty() {
            debug!("flush requested but buffer is empty");
            return Ok(());
        }
        info!(count = batch.len(), "manual flush requested");
        self.send_batch(batch).await
    }

    /// Stop the background flusher, drain the buffer, log final statistics.
    /// Must run on process exit.
    pub async fn shutdown(&self) -> Result<()> {
        info!("shutting down buffered indexer");
        let _ = self.inner.stop_tx.send(true);

        let handle = self.inner.flusher.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle
            && tokio::time::timeout(Duration::from_secs(5), handle).await.is_err()
        {
            warn!("flush worker did not stop within 5s");
        }

        let result = self.flush().await;

        let stats = self.stats().await;
        info!(
            buffered = stats.buffered,
            flushed = stats.flushed,
            batches = stats.batches,
            errors = stats.errors,
            "buffered indexer shutdown complete"
        );
        result
    }

    pub async fn stats(&self) -> IndexerStats {
        let state = self.inner.state.lock().await;
        IndexerStats {
            buffered: state.buffered,
            flushed: state.flushed,
            batches: state.batches,
            errors: state.errors,
            buffer_size: state.buffer.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{ChatInfo, ChatType, SenderInfo};
    use crate::types::Error;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn doc(n: i32) -> MessageDocument {
        MessageDocument {
            id: MessageDocument::composite_id(7, n),
            message_id: n,
            text: format!("message {}", n),
            caption: String::new(),
            chat: ChatInfo {
                id: 7,
                kind: ChatType::Private,
                title: String::new(),
                username: String::new(),
            },
            from_user: SenderInfo::default(),
            sender_chat: None,
            date: n as i64,
            timestamp: n as i64,
            entities: Vec::new(),
            is_deleted: false,
            deleted_at: 0,
        }
    }

    struct RecordingSink {
        batches: Mutex<Vec<Vec<MessageDocument>>>,
        fail: bool,
        calls: AtomicU64,
    }

    impl RecordingSink {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                batches: Mutex::new(Vec::new()),
                fail,
                calls: AtomicU64::new(0),
            })
        }
    }

    #[async_trait]
    impl BatchSink for RecordingSink {
        async fn upsert_batch(&self, docs: Vec<MessageDocument>) -> Result<BatchOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::Search("engine down".into()));
            }
            let count = docs.len() as u64;
            self.batches.lock().await.push(docs);
            Ok(BatchOutcome {
                indexed_count: count,
                failed_count: 0,
                errors: Vec::new(),
            })
        }
    }

    #[tokio::test]
    async fn test_size_trigger_flushes_full_batches() {
        let sink = RecordingSink::new(false);
        let indexer = BufferedIndexer::new(sink.clone(), 3, 3600.0);

        for n in 0..7 {
            indexer.upsert(doc(n)).await;
        }
        // Two size-triggered batches of 3; one document remains buffered.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stats = indexer.stats().await;
        assert_eq!(stats.buffered, 7);
        assert_eq!(stats.flushed, 6);
        assert_eq!(stats.batches, 2);
        assert_eq!(stats.buffer_size, 1);

        let batches = sink.batches.lock().await;
        assert!(batches.iter().all(|b| b.len() == 3));
    }

    #[tokio::test]
    async fn test_manual_flush_drains_tail() {
        let sink = RecordingSink::new(false);
        let indexer = BufferedIndexer::new(sink.clone(), 100, 3600.0);

        indexer.upsert(doc(1)).await;
        indexer.upsert(doc(2)).await;
        indexer.flush().await.unwrap();

        let stats = indexer.stats().await;
        assert_eq!(stats.flushed, 2);
        assert_eq!(stats.buffer_size, 0);
    }

    #[tokio::test]
    async fn test_empty_flush_issues_no_rpc() {
        let sink = RecordingSink::new(false);
        let indexer = BufferedIndexer::new(sink.clone(), 100, 3600.0);

        indexer.flush().await.unwrap();
        assert_eq!(sink.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_batch_is_dropped_and_counted() {
        let sink = RecordingSink::new(true);
        let indexer = BufferedIndexer::new(sink.clone(), 100, 3600.0);

        indexer.upsert(doc(1)).await;
        indexer.upsert(doc(2)).await;
        assert!(indexer.flush().await.is_err());

        let stats = indexer.stats().await;
        assert_eq!(stats.errors, 2);
        assert_eq!(stats.flushed, 0);
        assert_eq!(stats.buffer_size, 0);

        // No retry: a second flush finds an empty buffer.
        indexer.flush().await.unwrap();
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_drains_buffer() {
        let sink = RecordingSink::new(false);
        let indexer = BufferedIndexer::new(sink.clone(), 100, 3600.0);

        for n in 0..5 {
            indexer.upsert(doc(n)).await;
        }
        indexer.shutdown().await.unwrap();

        let stats = indexer.stats().await;
        assert_eq!(stats.buffer_size, 0);
        assert_eq!(stats.flushed + stats.errors, stats.buffered);
    }

    #[tokio::test]
    async fn test_time_trigger_flushes_nonempty_buffer() {
        let sink = RecordingSink::new(false);
        let indexer = BufferedIndexer::new(sink.clone(), 100, 0.05);

        indexer.upsert(doc(1)).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        let stats = indexer.stats().await;
        assert_eq!(stats.flushed, 1);
        assert_eq!(stats.buffer_size, 0);
    }

    #[tokio::test]
    async fn test_batch_size_one_degenerates_to_immediate_flush() {
        let sink = RecordingSink::new(false);
        let indexer = BufferedIndexer::new(sink.clone(), 1, 3600.0);

        for n in 0..3 {
            indexer.upsert(doc(n)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stats = indexer.stats().await;
        assert_eq!(stats.batches, 3);
        assert_eq!(stats.flushed, 3);
    }
}
