//! Engine client trait definition.
//!
//! This module defines the abstract interface the read and write pipelines
//! use to talk to the search engine, allowing for different backend
//! implementations (OpenSearch, the in-process mock engine, etc.).

use async_trait::async_trait;

use crate::errors::SearchError;
use crate::types::{BulkResponse, CursorHandle, ScrollPage, SearchPage, SearchRequest};
use search_connector_shared::{Batch, PartitionBounds, Query};

/// Abstract interface for search engine operations.
///
/// # Thread Safety
///
/// All implementations must be `Send + Sync`: bulk requests are issued from
/// spawned tasks while reads run concurrently on other tasks.
///
/// # Error Handling
///
/// All methods return `Result<T, SearchError>`. Transport failures are
/// reported as `SearchError::ConnectionError`, rejected queries as
/// `SearchError::QueryError`.
#[async_trait]
pub trait EngineClient: Send + Sync {
    /// Execute a search and open a scroll cursor over its results.
    ///
    /// # Arguments
    ///
    /// * `request` - Query, index, partition bounds, page size and keep-alive
    ///
    /// # Returns
    ///
    /// * `Ok(SearchPage)` - The first page, the cursor and the total hit count
    /// * `Err(SearchError)` - If the engine is unreachable or the query is invalid
    async fn search(&self, request: &SearchRequest) -> Result<SearchPage, SearchError>;

    /// Fetch the next page of an open cursor, renewing its lease.
    ///
    /// An empty page means the cursor is exhausted.
    async fn scroll_next(
        &self,
        cursor: &CursorHandle,
        keep_alive: &str,
    ) -> Result<ScrollPage, SearchError>;

    /// Release a cursor. Releasing an unknown or already released cursor
    /// succeeds.
    async fn release_cursor(&self, cursor: &CursorHandle) -> Result<(), SearchError>;

    /// Index every item of a batch in a single bulk request.
    ///
    /// # Returns
    ///
    /// * `Ok(BulkResponse)` - The request reached the engine; individual items
    ///   may still have been rejected and are listed in `failures`
    /// * `Err(SearchError)` - The request as a whole failed; no item was indexed
    async fn bulk(&self, batch: &Batch) -> Result<BulkResponse, SearchError>;

    /// Number of primary shards of an index.
    async fn shard_count(&self, index: &str) -> Result<u32, SearchError>;

    /// Count the documents a query matches within the given bounds.
    async fn count(
        &self,
        query: &Query,
        index: &str,
        bounds: PartitionBounds,
    ) -> Result<u64, SearchError>;

    /// Check if the engine is healthy and reachable.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - If the engine is healthy
    /// * `Ok(false)` - If the engine is reachable but unhealthy
    /// * `Err(SearchError)` - If the health check fails to execute
    async fn health_check(&self) -> Result<bool, SearchError>;
}
