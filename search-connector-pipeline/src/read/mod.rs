//! Read path: partition planning, scroll iteration and merged reads.

mod planner;
mod scroll;

use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use search_connector_repository::{EngineClient, DEFAULT_KEEP_ALIVE};
use search_connector_shared::{Document, Partition, Query};
use tracing::{info, instrument};

use crate::errors::ConnectorError;

pub use planner::{PartitionStrategy, ReadPlanner};
pub use scroll::ScrollIterator;

/// Configuration for bounded reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadConfig {
    /// Documents fetched per scroll page.
    pub page_size: usize,
    /// Lease renewed on every scroll request, in engine time units.
    pub keep_alive: String,
    pub strategy: PartitionStrategy,
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            keep_alive: DEFAULT_KEEP_ALIVE.to_string(),
            strategy: PartitionStrategy::default(),
        }
    }
}

/// Reads every document matching a query, one scroll per partition.
#[derive(Clone)]
pub struct SearchReader {
    client: Arc<dyn EngineClient>,
    planner: ReadPlanner,
    config: ReadConfig,
}

impl SearchReader {
    pub fn new(client: Arc<dyn EngineClient>, config: ReadConfig) -> Self {
        Self {
            planner: ReadPlanner::new(client.clone(), config.strategy),
            client,
            config,
        }
    }

    pub async fn plan(
        &self,
        query: &Query,
        index: &str,
        parallelism: usize,
    ) -> Result<Vec<Partition>, ConnectorError> {
        self.planner.plan(query, index, parallelism).await
    }

    /// Open a partition and stream its documents in scroll order.
    ///
    /// The scroll is opened on first poll.
    pub fn read_partition(
        &self,
        partition: Partition,
    ) -> impl futures::Stream<Item = Result<Document, ConnectorError>> + Send + 'static {
        let client = self.client.clone();
        let config = self.config.clone();

        stream::once(async move { ScrollIterator::open(client, partition, &config).await })
            .map_ok(ScrollIterator::into_stream)
            .try_flatten()
    }

    /// Stream every document matching `query`.
    ///
    /// Partitions are read concurrently and interleaved; order is only kept
    /// within a partition. A failing partition yields its error in place
    /// while the other partitions keep streaming. Dropping the stream
    /// releases every cursor still open.
    #[instrument(skip(self, query))]
    pub async fn read(
        &self,
        query: &Query,
        index: &str,
        parallelism: usize,
    ) -> Result<BoxStream<'static, Result<Document, ConnectorError>>, ConnectorError> {
        let partitions = self.plan(query, index, parallelism).await?;
        info!(partitions = partitions.len(), "Starting bounded read");

        let streams = partitions
            .into_iter()
            .map(|partition| self.read_partition(partition).boxed());
        Ok(stream::select_all(streams).boxed())
    }

    /// Collect every document matching `query`, stopping at the first error.
    pub async fn read_all(
        &self,
        query: &Query,
        index: &str,
        parallelism: usize,
    ) -> Result<Vec<Document>, ConnectorError> {
        self.read(query, index, parallelism)
            .await?
            .try_collect()
            .await
    }
}

impl std::fmt::Debug for SearchReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchReader")
            .field("config", &self.config)
            .finish()
    }
}
