//! Splits a query into independently readable partitions.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use search_connector_repository::EngineClient;
use search_connector_shared::{Partition, PartitionBounds, Query};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::errors::ConnectorError;

/// How a query is divided into partitions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionStrategy {
    /// One partition per shard, if the index has enough shards.
    #[default]
    ShardRouting,
    /// Server-side scroll slices, as many as requested.
    Sliced,
}

impl fmt::Display for PartitionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShardRouting => write!(f, "shard_routing"),
            Self::Sliced => write!(f, "sliced"),
        }
    }
}

impl FromStr for PartitionStrategy {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "shard_routing" | "shards" => Ok(Self::ShardRouting),
            "sliced" | "slices" => Ok(Self::Sliced),
            other => Err(ConnectorError::validation(format!(
                "Unknown partition strategy: {}",
                other
            ))),
        }
    }
}

/// Plans the partitions of a bounded read.
#[derive(Clone)]
pub struct ReadPlanner {
    client: Arc<dyn EngineClient>,
    strategy: PartitionStrategy,
}

impl ReadPlanner {
    pub fn new(client: Arc<dyn EngineClient>, strategy: PartitionStrategy) -> Self {
        Self { client, strategy }
    }

    pub fn strategy(&self) -> PartitionStrategy {
        self.strategy
    }

    /// Divide `query` over `index` into disjoint partitions that together
    /// cover every match.
    ///
    /// Slicing yields exactly `desired_parallelism` partitions. Shard routing
    /// yields one partition per shard, which may be more than requested, and
    /// falls back to a single partition when there are fewer shards. Each
    /// partition carries a count estimate when the engine can provide one.
    #[instrument(skip(self, query), fields(strategy = %self.strategy))]
    pub async fn plan(
        &self,
        query: &Query,
        index: &str,
        desired_parallelism: usize,
    ) -> Result<Vec<Partition>, ConnectorError> {
        if desired_parallelism == 0 {
            return Err(ConnectorError::validation(
                "Desired parallelism must be at least 1",
            ));
        }
        if index.is_empty() {
            return Err(ConnectorError::validation("Index name is empty"));
        }

        let bounds = match self.strategy {
            PartitionStrategy::ShardRouting => {
                self.shard_bounds(index, desired_parallelism).await?
            }
            PartitionStrategy::Sliced => slice_bounds(desired_parallelism),
        };

        let mut partitions = Vec::with_capacity(bounds.len());
        for bounds in bounds {
            let partition = Partition::new(query.clone(), index, bounds);
            partitions.push(self.estimate(partition).await);
        }

        info!(partitions = partitions.len(), "Planned read");
        Ok(partitions)
    }

    async fn shard_bounds(
        &self,
        index: &str,
        desired_parallelism: usize,
    ) -> Result<Vec<PartitionBounds>, ConnectorError> {
        let shards = self.client.shard_count(index).await?;
        debug!(shards, desired_parallelism, "Resolved shard count");

        if desired_parallelism > 1 && shards as usize >= desired_parallelism {
            Ok((0..shards).map(PartitionBounds::Shard).collect())
        } else {
            Ok(vec![PartitionBounds::Whole])
        }
    }

    async fn estimate(&self, partition: Partition) -> Partition {
        match self
            .client
            .count(&partition.query, &partition.index, partition.bounds)
            .await
        {
            Ok(count) => partition.with_estimated_count(count),
            Err(e) => {
                warn!(
                    bounds = %partition.bounds,
                    error = %e,
                    "Could not estimate partition size"
                );
                partition
            }
        }
    }
}

impl fmt::Debug for ReadPlanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadPlanner")
            .field("strategy", &self.strategy)
            .finish()
    }
}

fn slice_bounds(desired_parallelism: usize) -> Vec<PartitionBounds> {
    if desired_parallelism == 1 {
        return vec![PartitionBounds::Whole];
    }
    let max = desired_parallelism as u32;
    (0..max).map(|id| PartitionBounds::Slice { id, max }).collect()
}
