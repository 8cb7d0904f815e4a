use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use search_connector_repository::EngineClient;
use search_connector_shared::{IndexTarget, Record};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::{BulkBatcher, BulkDispatcher, DispatcherState, DrainSummary};
use crate::errors::ConnectorError;

/// Configuration for the bulk writer.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum number of actions per bulk request.
    pub batch_size: usize,
    /// Maximum estimated size of a bulk request in bytes.
    pub max_bulk_request_bytes: usize,
    /// Interval after which a partial batch is flushed. `None` disables the
    /// periodic flush.
    pub flush_interval: Option<Duration>,
    /// Maximum number of bulk requests in flight.
    pub concurrent_requests: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_bulk_request_bytes: 5 * 1024 * 1024,
            flush_interval: Some(Duration::from_secs(5)),
            concurrent_requests: 5,
        }
    }
}

struct WriterInner {
    batcher: Mutex<BulkBatcher>,
    dispatcher: BulkDispatcher,
}

impl WriterInner {
    async fn flush(&self) -> Result<(), ConnectorError> {
        let mut batcher = self.batcher.lock().await;
        if let Some(batch) = batcher.flush() {
            self.dispatcher.submit(batch).await?;
        }
        Ok(())
    }
}

struct Flusher {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Writes records to the search engine in bulk.
///
/// Records are grouped by the batcher and handed to the dispatcher as soon as
/// a batch fills up; partial batches go out on `flush`, on the flush
/// interval, and on `close`. Must be created inside a tokio runtime.
pub struct BulkWriter {
    inner: Arc<WriterInner>,
    flusher: StdMutex<Option<Flusher>>,
}

impl BulkWriter {
    pub fn new(client: Arc<dyn EngineClient>, config: WriterConfig) -> Self {
        let inner = Arc::new(WriterInner {
            batcher: Mutex::new(BulkBatcher::new(
                config.batch_size,
                config.max_bulk_request_bytes,
            )),
            dispatcher: BulkDispatcher::new(client, config.concurrent_requests),
        });

        let flusher = config
            .flush_interval
            .filter(|interval| !interval.is_zero())
            .map(|interval| spawn_flusher(Arc::downgrade(&inner), interval));

        Self {
            inner,
            flusher: StdMutex::new(flusher),
        }
    }

    /// Add a record to the current batch, dispatching it if full.
    ///
    /// Waits when the dispatcher is at its concurrency limit.
    pub async fn write(&self, record: Record, target: IndexTarget) -> Result<(), ConnectorError> {
        let mut batcher = self.inner.batcher.lock().await;
        if self.inner.dispatcher.state() != DispatcherState::Open {
            return Err(ConnectorError::state("Writer is closed"));
        }
        if let Some(batch) = batcher.add(record, target)? {
            self.inner.dispatcher.submit(batch).await?;
        }
        Ok(())
    }

    /// Write every record of an iterator to the same target.
    #[instrument(skip(self, records, target), fields(index = %target.index))]
    pub async fn write_all<I>(
        &self,
        records: I,
        target: &IndexTarget,
    ) -> Result<usize, ConnectorError>
    where
        I: IntoIterator<Item = Record>,
    {
        let mut written = 0;
        for record in records {
            self.write(record, target.clone()).await?;
            written += 1;
        }
        debug!(written, "Records handed to the writer");
        Ok(written)
    }

    /// Dispatch the current partial batch without waiting for it.
    pub async fn flush(&self) -> Result<(), ConnectorError> {
        self.inner.flush().await
    }

    /// Flush, wait for every bulk request and release the engine client.
    ///
    /// Fails with `PartialBulkFailure` if any record was not acknowledged.
    #[instrument(skip(self))]
    pub async fn close(&self) -> Result<DrainSummary, ConnectorError> {
        let flusher = self
            .flusher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(flusher) = flusher {
            let _ = flusher.shutdown.send(true);
            if let Err(e) = flusher.handle.await {
                warn!(error = %e, "Flush task ended abnormally");
            }
        }

        self.inner.flush().await?;
        let summary = self.inner.dispatcher.close().await?;

        if summary.is_success() {
            info!(
                batches = summary.batches,
                acknowledged = summary.acknowledged,
                "Bulk writer closed"
            );
            Ok(summary)
        } else {
            Err(ConnectorError::partial_failure(
                summary.acknowledged,
                summary.failures,
            ))
        }
    }

    pub fn dispatcher(&self) -> &BulkDispatcher {
        &self.inner.dispatcher
    }
}

impl Drop for BulkWriter {
    fn drop(&mut self) {
        let flusher = self
            .flusher
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(flusher) = flusher {
            let _ = flusher.shutdown.send(true);
        }

        if self.inner.dispatcher.state() == DispatcherState::Open {
            let pending = self
                .inner
                .batcher
                .try_lock()
                .map(|batcher| batcher.pending())
                .unwrap_or_default();
            warn!(
                unflushed = pending,
                in_flight = self.inner.dispatcher.pending_items(),
                "Bulk writer dropped without close"
            );
        }
    }
}

fn spawn_flusher(inner: Weak<WriterInner>, interval: Duration) -> Flusher {
    let (shutdown, mut stopped) = watch::channel(false);

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(inner) = inner.upgrade() else { break };
                    if inner.dispatcher.state() != DispatcherState::Open {
                        break;
                    }
                    if let Err(e) = inner.flush().await {
                        warn!(error = %e, "Periodic flush failed");
                    }
                }
                _ = stopped.changed() => break,
            }
        }
        debug!("Flush task stopped");
    });

    Flusher { shutdown, handle }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use search_connector_repository::{
        BulkItemError, BulkResponse, CursorHandle, ScrollPage, SearchError, SearchPage,
        SearchRequest,
    };
    use search_connector_shared::{Batch, PartitionBounds, Query};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Engine client that records bulk sizes and rejects records containing
    /// "reject".
    #[derive(Default)]
    struct RecordingClient {
        bulk_sizes: StdMutex<Vec<usize>>,
        written: AtomicUsize,
    }

    #[async_trait]
    impl EngineClient for RecordingClient {
        async fn search(&self, _request: &SearchRequest) -> Result<SearchPage, SearchError> {
            Err(SearchError::query("not supported"))
        }

        async fn scroll_next(
            &self,
            _cursor: &CursorHandle,
            _keep_alive: &str,
        ) -> Result<ScrollPage, SearchError> {
            Err(SearchError::cursor("not supported"))
        }

        async fn release_cursor(&self, _cursor: &CursorHandle) -> Result<(), SearchError> {
            Ok(())
        }

        async fn bulk(&self, batch: &Batch) -> Result<BulkResponse, SearchError> {
            self.bulk_sizes.lock().unwrap().push(batch.len());
            let mut response = BulkResponse::default();
            for (position, item) in batch.items().iter().enumerate() {
                if item.record.as_str().is_some_and(|s| s.contains("reject")) {
                    response
                        .failures
                        .push(BulkItemError::new(position, Some(400), "rejected"));
                } else {
                    response.acknowledged += 1;
                }
            }
            self.written.fetch_add(response.acknowledged, Ordering::SeqCst);
            Ok(response)
        }

        async fn shard_count(&self, _index: &str) -> Result<u32, SearchError> {
            Ok(1)
        }

        async fn count(
            &self,
            _query: &Query,
            _index: &str,
            _bounds: PartitionBounds,
        ) -> Result<u64, SearchError> {
            Ok(0)
        }

        async fn health_check(&self) -> Result<bool, SearchError> {
            Ok(true)
        }
    }

    fn target() -> IndexTarget {
        IndexTarget::new("beam", "test")
    }

    fn config(batch_size: usize) -> WriterConfig {
        WriterConfig {
            batch_size,
            flush_interval: None,
            ..WriterConfig::default()
        }
    }

    #[tokio::test]
    async fn test_write_batches_and_close() {
        let client = Arc::new(RecordingClient::default());
        let writer = BulkWriter::new(client.clone(), config(10));

        let records = (0..25).map(|i| Record::from(format!("{{\"id\":{}}}", i)));
        assert_eq!(writer.write_all(records, &target()).await.unwrap(), 25);

        let summary = writer.close().await.unwrap();
        assert_eq!(summary.acknowledged, 25);
        assert_eq!(summary.batches, 3);

        let mut sizes = client.bulk_sizes.lock().unwrap().clone();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![5, 10, 10]);
    }

    #[tokio::test]
    async fn test_close_surfaces_partial_failure() {
        let client = Arc::new(RecordingClient::default());
        let writer = BulkWriter::new(client.clone(), config(4));

        for i in 0..6 {
            let payload = if i == 2 {
                "{\"reject\":true}".to_string()
            } else {
                format!("{{\"id\":{}}}", i)
            };
            writer.write(Record::from(payload), target()).await.unwrap();
        }

        match writer.close().await {
            Err(ConnectorError::PartialBulkFailure {
                failed,
                acknowledged,
                failures,
            }) => {
                assert_eq!(failed, 1);
                assert_eq!(acknowledged, 5);
                assert_eq!(failures[0].position, 2);
                assert_eq!(failures[0].status, Some(400));
            }
            other => panic!("expected partial failure, got {:?}", other),
        }
        assert_eq!(client.written.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let writer = BulkWriter::new(Arc::new(RecordingClient::default()), config(10));
        writer.close().await.unwrap();

        let err = writer.write(Record::from("{}"), target()).await.unwrap_err();
        assert!(err.is_state());
        assert!(writer.close().await.unwrap_err().is_state());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_flush() {
        let client = Arc::new(RecordingClient::default());
        let writer = BulkWriter::new(
            client.clone(),
            WriterConfig {
                batch_size: 100,
                flush_interval: Some(Duration::from_secs(5)),
                ..WriterConfig::default()
            },
        );

        writer.write(Record::from("{\"id\":1}"), target()).await.unwrap();
        assert!(client.bulk_sizes.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(6)).await;
        // Let the spawned bulk request run
        tokio::task::yield_now().await;
        while writer.dispatcher().pending_items() > 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(*client.bulk_sizes.lock().unwrap(), vec![1]);

        let summary = writer.close().await.unwrap();
        assert_eq!(summary.acknowledged, 1);
    }
}
