//! Bulk dispatcher with bounded concurrency and drain-on-close.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use search_connector_repository::{BulkResponse, EngineClient, SearchError};
use search_connector_shared::{Batch, IndexTarget};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, instrument, warn};

use crate::errors::ConnectorError;

/// Lifecycle of a dispatcher. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Open,
    Draining,
    Closed,
}

/// A single item that was not acknowledged by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    pub batch_id: u64,
    /// Position of the item inside its batch.
    pub position: usize,
    pub target: IndexTarget,
    /// HTTP status reported for the item, if any.
    pub status: Option<u16>,
    pub reason: String,
}

/// Outcome of draining a dispatcher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainSummary {
    /// Batches that completed, successfully or not.
    pub batches: usize,
    pub acknowledged: usize,
    pub failures: Vec<ItemFailure>,
}

impl DrainSummary {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Progress {
    pending_items: usize,
    in_flight_batches: usize,
}

impl Progress {
    fn is_quiescent(&self) -> bool {
        self.pending_items == 0 && self.in_flight_batches == 0
    }
}

/// State shared between the dispatcher and its completion tasks.
#[derive(Debug)]
struct Shared {
    progress: watch::Sender<Progress>,
    totals: Mutex<DrainSummary>,
}

impl Shared {
    fn totals(&self) -> MutexGuard<'_, DrainSummary> {
        self.totals.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record the outcome of one batch and remove its items from the pending
    /// count. Totals are updated first so a drain that observes quiescence
    /// also observes every outcome.
    fn complete(&self, items: usize, acknowledged: usize, failures: Vec<ItemFailure>) {
        {
            let mut totals = self.totals();
            totals.batches += 1;
            totals.acknowledged += acknowledged;
            totals.failures.extend(failures);
        }

        self.progress.send_modify(|progress| {
            debug_assert!(progress.pending_items >= items);
            progress.pending_items = progress.pending_items.saturating_sub(items);
            progress.in_flight_batches = progress.in_flight_batches.saturating_sub(1);
        });
    }
}

/// Completes a batch exactly once, even if the bulk task panics or is aborted
/// before reporting.
struct Completion {
    shared: Arc<Shared>,
    batch: Arc<Batch>,
    done: bool,
}

impl Completion {
    fn finish(mut self, result: Result<BulkResponse, SearchError>) {
        let (acknowledged, failures) = reconcile(&self.batch, result);
        self.shared.complete(self.batch.len(), acknowledged, failures);
        self.done = true;
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        error!(
            batch_id = self.batch.id(),
            items = self.batch.len(),
            "Bulk request ended without a response"
        );
        let failures = fail_all(&self.batch, None, "Bulk request was aborted");
        self.shared.complete(self.batch.len(), 0, failures);
    }
}

/// Hands sealed batches to the engine with at most `concurrency` bulk
/// requests in flight.
///
/// `submit` waits for a free slot, then runs the request on a spawned task
/// and returns. `close` stops accepting batches and waits until every
/// submitted item has been acknowledged or failed.
pub struct BulkDispatcher {
    client: Mutex<Option<Arc<dyn EngineClient>>>,
    permits: Arc<Semaphore>,
    concurrency: usize,
    state: Mutex<DispatcherState>,
    shared: Arc<Shared>,
}

impl BulkDispatcher {
    /// Create a dispatcher. A concurrency of zero is treated as one.
    pub fn new(client: Arc<dyn EngineClient>, concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        let (progress, _) = watch::channel(Progress::default());

        Self {
            client: Mutex::new(Some(client)),
            permits: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            state: Mutex::new(DispatcherState::Open),
            shared: Arc::new(Shared {
                progress,
                totals: Mutex::new(DrainSummary::default()),
            }),
        }
    }

    /// Submit a batch for execution.
    ///
    /// Suspends while `concurrency` requests are already in flight.
    #[instrument(skip(self, batch), fields(batch_id = batch.id(), items = batch.len()))]
    pub async fn submit(&self, batch: Batch) -> Result<(), ConnectorError> {
        self.ensure_open()?;
        if batch.is_empty() {
            return Ok(());
        }

        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ConnectorError::Cancelled)?;

        // Admission and the pending increment happen under the state lock so
        // that a concurrent close cannot miss this batch.
        let client = {
            let state = self.lock_state();
            if *state != DispatcherState::Open {
                return Err(ConnectorError::state(format!(
                    "Cannot submit to a {:?} dispatcher",
                    *state
                )));
            }
            let client = self.client()?;
            let items = batch.len();
            self.shared.progress.send_modify(|progress| {
                progress.pending_items += items;
                progress.in_flight_batches += 1;
            });
            client
        };

        debug!("Dispatching bulk request");
        self.spawn_request(client, Arc::new(batch), permit);
        Ok(())
    }

    fn spawn_request(
        &self,
        client: Arc<dyn EngineClient>,
        batch: Arc<Batch>,
        permit: OwnedSemaphorePermit,
    ) {
        let completion = Completion {
            shared: self.shared.clone(),
            batch: batch.clone(),
            done: false,
        };

        tokio::spawn(async move {
            let result = client.bulk(&batch).await;
            completion.finish(result);
            drop(permit);
        });
    }

    /// Stop accepting batches and wait for all in-flight requests.
    ///
    /// Releases the engine client once drained. If the returned future is
    /// dropped before the drain completes, the dispatcher still ends up
    /// `Closed` with its client released. Requests already in flight keep
    /// running on their own client handle and their outcomes remain visible
    /// through [`BulkDispatcher::summary`].
    #[instrument(skip(self))]
    pub async fn close(&self) -> Result<DrainSummary, ConnectorError> {
        {
            let mut state = self.lock_state();
            if *state != DispatcherState::Open {
                return Err(ConnectorError::state("Dispatcher is already closed"));
            }
            *state = DispatcherState::Draining;
        }
        let mut drain = DrainGuard {
            dispatcher: self,
            finished: false,
        };
        // Wake submitters still waiting for a slot
        self.permits.close();

        let progress = *self.shared.progress.borrow();
        info!(
            pending_items = progress.pending_items,
            in_flight_batches = progress.in_flight_batches,
            "Draining bulk dispatcher"
        );

        let mut receiver = self.shared.progress.subscribe();
        receiver
            .wait_for(Progress::is_quiescent)
            .await
            .map_err(|_| ConnectorError::state("Progress channel closed while draining"))?;

        drain.finished = true;
        self.shut_down();

        let summary = std::mem::take(&mut *self.shared.totals());
        info!(
            batches = summary.batches,
            acknowledged = summary.acknowledged,
            failed = summary.failures.len(),
            "Bulk dispatcher closed"
        );
        Ok(summary)
    }

    /// Items submitted but not yet acknowledged or failed.
    pub fn pending_items(&self) -> usize {
        self.shared.progress.borrow().pending_items
    }

    pub fn in_flight_batches(&self) -> usize {
        self.shared.progress.borrow().in_flight_batches
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn state(&self) -> DispatcherState {
        *self.lock_state()
    }

    /// Failures recorded so far.
    pub fn failures(&self) -> Vec<ItemFailure> {
        self.shared.totals().failures.clone()
    }

    /// Totals recorded since the last completed [`BulkDispatcher::close`].
    pub fn summary(&self) -> DrainSummary {
        self.shared.totals().clone()
    }

    fn shut_down(&self) {
        *self.lock_state() = DispatcherState::Closed;
        self.client
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }

    fn ensure_open(&self) -> Result<(), ConnectorError> {
        match self.state() {
            DispatcherState::Open => Ok(()),
            state => Err(ConnectorError::state(format!(
                "Cannot submit to a {:?} dispatcher",
                state
            ))),
        }
    }

    fn client(&self) -> Result<Arc<dyn EngineClient>, ConnectorError> {
        self.client
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(|| ConnectorError::state("Engine client already released"))
    }

    fn lock_state(&self) -> MutexGuard<'_, DispatcherState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for BulkDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkDispatcher")
            .field("concurrency", &self.concurrency)
            .field("state", &self.state())
            .field("progress", &*self.shared.progress.borrow())
            .finish()
    }
}

/// Finalizes a drain whose `close` future was dropped early.
struct DrainGuard<'a> {
    dispatcher: &'a BulkDispatcher,
    finished: bool,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!(
            pending_items = self.dispatcher.pending_items(),
            in_flight_batches = self.dispatcher.in_flight_batches(),
            "Dispatcher close interrupted before drain completed"
        );
        self.dispatcher.shut_down();
    }
}

/// Split a bulk outcome into the acknowledged count and per-item failures.
///
/// Every position of the batch ends up either acknowledged or failed. The
/// engine reports items in request order, so positions it did not mention
/// beyond its acknowledged count are failures.
fn reconcile(
    batch: &Batch,
    result: Result<BulkResponse, SearchError>,
) -> (usize, Vec<ItemFailure>) {
    let response = match result {
        Ok(response) => response,
        Err(e) => {
            error!(
                batch_id = batch.id(),
                items = batch.len(),
                error = %e,
                "Bulk request failed"
            );
            return (0, fail_all(batch, None, &e.to_string()));
        }
    };

    let mut listed = BTreeMap::new();
    for failure in response.failures {
        if failure.position < batch.len() {
            listed.entry(failure.position).or_insert(failure);
        } else {
            warn!(
                batch_id = batch.id(),
                position = failure.position,
                "Engine reported a failure for an unknown position"
            );
        }
    }

    let acknowledged = response.acknowledged.min(batch.len() - listed.len());
    let unreported: Vec<usize> = (0..batch.len())
        .filter(|position| !listed.contains_key(position))
        .skip(acknowledged)
        .collect();
    let mut failures: Vec<ItemFailure> = listed
        .into_values()
        .map(|failure| ItemFailure {
            batch_id: batch.id(),
            position: failure.position,
            target: batch.items()[failure.position].target.clone(),
            status: failure.status,
            reason: failure.reason,
        })
        .collect();

    for position in unreported {
        failures.push(ItemFailure {
            batch_id: batch.id(),
            position,
            target: batch.items()[position].target.clone(),
            status: None,
            reason: "Item not acknowledged by the engine".to_string(),
        });
    }
    failures.sort_by_key(|failure| failure.position);

    if failures.is_empty() {
        debug!(batch_id = batch.id(), acknowledged, "Bulk request acknowledged");
    } else {
        warn!(
            batch_id = batch.id(),
            acknowledged,
            failed = failures.len(),
            "Bulk request completed with failures"
        );
    }

    (acknowledged, failures)
}

fn fail_all(batch: &Batch, status: Option<u16>, reason: &str) -> Vec<ItemFailure> {
    batch
        .items()
        .iter()
        .enumerate()
        .map(|(position, item)| ItemFailure {
            batch_id: batch.id(),
            position,
            target: item.target.clone(),
            status,
            reason: reason.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use search_connector_repository::{
        BulkItemError, CursorHandle, ScrollPage, SearchPage, SearchRequest,
    };
    use search_connector_shared::{BulkItem, PartitionBounds, Query, Record};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Engine client that only implements bulk, with a configurable outcome.
    struct BulkOnlyClient {
        outcome: fn(&Batch) -> Result<BulkResponse, SearchError>,
        latency: Duration,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl BulkOnlyClient {
        fn new(outcome: fn(&Batch) -> Result<BulkResponse, SearchError>) -> Self {
            Self {
                outcome,
                latency: Duration::from_millis(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
            }
        }

        fn with_latency(mut self, latency: Duration) -> Self {
            self.latency = latency;
            self
        }
    }

    #[async_trait]
    impl EngineClient for BulkOnlyClient {
        async fn search(&self, _request: &SearchRequest) -> Result<SearchPage, SearchError> {
            unimplemented!()
        }

        async fn scroll_next(
            &self,
            _cursor: &CursorHandle,
            _keep_alive: &str,
        ) -> Result<ScrollPage, SearchError> {
            unimplemented!()
        }

        async fn release_cursor(&self, _cursor: &CursorHandle) -> Result<(), SearchError> {
            Ok(())
        }

        async fn bulk(&self, batch: &Batch) -> Result<BulkResponse, SearchError> {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            tokio::time::sleep(self.latency).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            (self.outcome)(batch)
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

    fn batch(id: u64, size: usize) -> Batch {
        let items = (0..size)
            .map(|i| {
                BulkItem::new(
                    Record::from(format!("{{\"n\":{}}}", i)),
                    IndexTarget::new("beam", "test"),
                )
            })
            .collect();
        Batch::new(id, items)
    }

    fn acknowledge_all(batch: &Batch) -> Result<BulkResponse, SearchError> {
        Ok(BulkResponse::all_acknowledged(batch.len()))
    }

    #[tokio::test]
    async fn test_submit_and_drain() {
        let client = Arc::new(BulkOnlyClient::new(acknowledge_all));
        let dispatcher = BulkDispatcher::new(client, 2);

        for id in 1..=4 {
            dispatcher.submit(batch(id, 10)).await.unwrap();
        }
        let summary = dispatcher.close().await.unwrap();

        assert_eq!(summary.batches, 4);
        assert_eq!(summary.acknowledged, 40);
        assert!(summary.is_success());
        assert_eq!(dispatcher.pending_items(), 0);
        assert_eq!(dispatcher.in_flight_batches(), 0);
        assert_eq!(dispatcher.state(), DispatcherState::Closed);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let client = Arc::new(
            BulkOnlyClient::new(acknowledge_all).with_latency(Duration::from_millis(20)),
        );
        let dispatcher = BulkDispatcher::new(client.clone(), 3);

        for id in 1..=12 {
            dispatcher.submit(batch(id, 5)).await.unwrap();
            assert!(dispatcher.in_flight_batches() <= 3);
        }
        dispatcher.close().await.unwrap();

        let max_active = client.max_active.load(Ordering::SeqCst);
        assert!(max_active <= 3, "saw {} concurrent bulk requests", max_active);
        assert!(max_active >= 1);
    }

    #[tokio::test]
    async fn test_submit_after_close_fails() {
        let client = Arc::new(BulkOnlyClient::new(acknowledge_all));
        let dispatcher = BulkDispatcher::new(client, 1);
        dispatcher.close().await.unwrap();

        for _ in 0..3 {
            let err = dispatcher.submit(batch(1, 1)).await.unwrap_err();
            assert!(err.is_state());
        }
        assert!(dispatcher.close().await.unwrap_err().is_state());
    }

    #[tokio::test]
    async fn test_interrupted_close_still_shuts_down() {
        let client = Arc::new(
            BulkOnlyClient::new(acknowledge_all).with_latency(Duration::from_millis(50)),
        );
        let dispatcher = BulkDispatcher::new(client.clone(), 1);
        dispatcher.submit(batch(1, 10)).await.unwrap();

        let interrupted =
            tokio::time::timeout(Duration::from_millis(5), dispatcher.close()).await;
        assert!(interrupted.is_err());
        assert_eq!(dispatcher.state(), DispatcherState::Closed);
        assert!(dispatcher.submit(batch(2, 1)).await.unwrap_err().is_state());
        assert!(dispatcher.close().await.unwrap_err().is_state());

        // The in-flight request finishes on its own handle and then lets go
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(dispatcher.pending_items(), 0);
        assert_eq!(Arc::strong_count(&client), 1);
        let summary = dispatcher.summary();
        assert_eq!(summary.batches, 1);
        assert_eq!(summary.acknowledged, 10);
    }

    #[tokio::test]
    async fn test_transport_error_fails_every_item() {
        fn refuse(_batch: &Batch) -> Result<BulkResponse, SearchError> {
            Err(SearchError::connection("connection refused"))
        }
        let dispatcher = BulkDispatcher::new(Arc::new(BulkOnlyClient::new(refuse)), 1);

        dispatcher.submit(batch(7, 4)).await.unwrap();
        let summary = dispatcher.close().await.unwrap();

        assert_eq!(summary.acknowledged, 0);
        assert_eq!(summary.failures.len(), 4);
        assert!(summary.failures.iter().all(|f| f.batch_id == 7));
        assert!(summary.failures[0].reason.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_listed_and_unreported_items_fail() {
        fn partial(batch: &Batch) -> Result<BulkResponse, SearchError> {
            // Position 1 rejected, only one other item reported back
            assert_eq!(batch.len(), 4);
            Ok(BulkResponse {
                acknowledged: 1,
                failures: vec![BulkItemError::new(1, Some(400), "mapper_parsing_exception")],
            })
        }
        let dispatcher = BulkDispatcher::new(Arc::new(BulkOnlyClient::new(partial)), 1);

        dispatcher.submit(batch(1, 4)).await.unwrap();
        let summary = dispatcher.close().await.unwrap();

        assert_eq!(summary.acknowledged, 1);
        let positions: Vec<usize> = summary.failures.iter().map(|f| f.position).collect();
        assert_eq!(positions, vec![1, 2, 3]);
        assert_eq!(summary.failures[0].status, Some(400));
        assert_eq!(summary.failures[1].status, None);
    }

    #[tokio::test]
    async fn test_panicking_request_still_completes() {
        fn explode(_batch: &Batch) -> Result<BulkResponse, SearchError> {
            panic!("engine client bug");
        }
        let dispatcher = BulkDispatcher::new(Arc::new(BulkOnlyClient::new(explode)), 1);

        dispatcher.submit(batch(1, 3)).await.unwrap();
        let summary = dispatcher.close().await.unwrap();

        assert_eq!(summary.failures.len(), 3);
        assert_eq!(dispatcher.pending_items(), 0);
    }

    #[tokio::test]
    async fn test_empty_batch_is_ignored() {
        let dispatcher = BulkDispatcher::new(Arc::new(BulkOnlyClient::new(acknowledge_all)), 1);

        dispatcher.submit(Batch::new(1, Vec::new())).await.unwrap();
        let summary = dispatcher.close().await.unwrap();
        assert_eq!(summary.batches, 0);
    }
}
