//! Sequential reader over one partition, backed by a scroll cursor.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::stream::{self, Stream, TryStreamExt};
use search_connector_repository::{CursorHandle, EngineClient, SearchRequest};
use search_connector_shared::{Document, Partition};
use tokio::runtime::Handle;
use tracing::{debug, instrument, warn};

use super::ReadConfig;
use crate::errors::ConnectorError;

/// Reads a single partition page by page.
///
/// The cursor is released exactly once: when the engine runs out of hits,
/// on `release`, or from a spawned task when the iterator is dropped early.
pub struct ScrollIterator {
    client: Arc<dyn EngineClient>,
    partition: Partition,
    keep_alive: String,
    cursor: Option<CursorHandle>,
    buffered: VecDeque<Document>,
    total: u64,
    exhausted: bool,
    released: bool,
}

impl ScrollIterator {
    /// Run the initial search and position the iterator on its first page.
    #[instrument(
        skip(client, partition, config),
        fields(index = %partition.index, bounds = %partition.bounds)
    )]
    pub async fn open(
        client: Arc<dyn EngineClient>,
        partition: Partition,
        config: &ReadConfig,
    ) -> Result<Self, ConnectorError> {
        let request = SearchRequest::new(partition.query.clone(), partition.index.clone())
            .with_bounds(partition.bounds)
            .with_page_size(config.page_size)
            .with_keep_alive(config.keep_alive.clone());

        let page = client.search(&request).await?;
        debug!(total = page.total, cursor = %page.cursor, "Opened scroll");

        let mut iterator = Self {
            client,
            partition,
            keep_alive: config.keep_alive.clone(),
            cursor: Some(page.cursor),
            buffered: VecDeque::new(),
            total: page.total,
            exhausted: false,
            released: false,
        };

        if page.documents.is_empty() {
            iterator.finish().await;
        } else {
            iterator.buffered = page.documents.into();
        }
        Ok(iterator)
    }

    /// Next page of documents, or `None` once the partition is exhausted.
    pub async fn advance(&mut self) -> Result<Option<Vec<Document>>, ConnectorError> {
        if !self.buffered.is_empty() {
            return Ok(Some(self.buffered.drain(..).collect()));
        }
        if self.released {
            return Err(ConnectorError::state("Scroll cursor was released"));
        }
        if self.exhausted {
            return Ok(None);
        }

        let Some(cursor) = self.cursor.as_ref() else {
            return Err(ConnectorError::state("Scroll has no open cursor"));
        };

        let page = match self.client.scroll_next(cursor, &self.keep_alive).await {
            Ok(page) => page,
            Err(e) => {
                warn!(
                    bounds = %self.partition.bounds,
                    error = %e,
                    "Scroll failed, abandoning partition"
                );
                self.finish().await;
                return Err(e.into());
            }
        };

        if page.documents.is_empty() {
            self.finish().await;
            return Ok(None);
        }
        if !page.has_more {
            self.finish().await;
        }
        Ok(Some(page.documents))
    }

    /// Single-document convenience over `advance`.
    pub async fn next_document(&mut self) -> Result<Option<Document>, ConnectorError> {
        loop {
            if let Some(document) = self.buffered.pop_front() {
                return Ok(Some(document));
            }
            match self.advance().await? {
                Some(page) => self.buffered = page.into(),
                None => return Ok(None),
            }
        }
    }

    /// Abandon the partition and release its cursor now.
    ///
    /// Later calls to `advance` fail with a state error.
    pub async fn release(&mut self) -> Result<(), ConnectorError> {
        self.buffered.clear();
        if !self.exhausted {
            self.released = true;
        }
        self.exhausted = true;

        if let Some(result) = self.release_cursor().await {
            result?;
            debug!("Released scroll cursor");
        }
        Ok(())
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Total hits reported when the scroll was opened.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted && self.buffered.is_empty()
    }

    /// Stream the remaining documents of the partition in scroll order.
    pub fn into_stream(self) -> impl Stream<Item = Result<Document, ConnectorError>> + Send {
        stream::try_unfold(self, |mut iterator| async move {
            let page = iterator.advance().await?;
            Ok::<_, ConnectorError>(page.map(|documents| {
                let documents = documents.into_iter().map(Ok::<_, ConnectorError>);
                (stream::iter(documents), iterator)
            }))
        })
        .try_flatten()
    }

    /// Mark the partition done and release the cursor. Release errors are
    /// logged only: the data has already been read.
    async fn finish(&mut self) {
        self.exhausted = true;
        match self.release_cursor().await {
            Some(Ok(())) => debug!("Released exhausted scroll cursor"),
            Some(Err(e)) => warn!(error = %e, "Failed to release scroll cursor"),
            None => {}
        }
    }

    /// Release the cursor, if still held.
    ///
    /// The handle is only cleared once the engine has answered, so a future
    /// dropped mid-release leaves the cursor to `Drop`.
    async fn release_cursor(&mut self) -> Option<Result<(), ConnectorError>> {
        let cursor = self.cursor.as_ref()?;
        let result = self.client.release_cursor(cursor).await;
        self.cursor = None;
        Some(result.map_err(ConnectorError::from))
    }
}

impl Drop for ScrollIterator {
    fn drop(&mut self) {
        let Some(cursor) = self.cursor.take() else {
            return;
        };

        match Handle::try_current() {
            Ok(handle) => {
                let client = self.client.clone();
                handle.spawn(async move {
                    if let Err(e) = client.release_cursor(&cursor).await {
                        warn!(
                            cursor = %cursor,
                            error = %e,
                            "Failed to release abandoned scroll cursor"
                        );
                    }
                });
            }
            Err(_) => warn!(
                cursor = %cursor,
                "No runtime to release abandoned scroll cursor, it will expire with its keep-alive"
            ),
        }
    }
}

impl std::fmt::Debug for ScrollIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScrollIterator")
            .field("partition", &self.partition)
            .field("cursor", &self.cursor)
            .field("total", &self.total)
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::StreamExt;
    use search_connector_repository::{BulkResponse, ScrollPage, SearchError, SearchPage};
    use search_connector_shared::{Batch, PartitionBounds, Query, Record};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Engine client serving fixed pages from a single cursor.
    struct PagedClient {
        pages: Mutex<Vec<Vec<Document>>>,
        releases: Mutex<Vec<String>>,
        fail_scroll: bool,
        release_latency: Duration,
    }

    impl PagedClient {
        fn new(page_sizes: &[usize]) -> Self {
            let mut n = 0;
            let pages = page_sizes
                .iter()
                .map(|&size| {
                    (0..size)
                        .map(|_| {
                            n += 1;
                            let source = Record::from(format!("{{\"n\":{}}}", n));
                            Document::new(n.to_string(), "beam", source)
                        })
                        .collect()
                })
                .collect();
            Self {
                pages: Mutex::new(pages),
                releases: Mutex::new(Vec::new()),
                fail_scroll: false,
                release_latency: Duration::ZERO,
            }
        }

        fn next_page(&self) -> Vec<Document> {
            let mut pages = self.pages.lock().unwrap();
            if pages.is_empty() {
                Vec::new()
            } else {
                pages.remove(0)
            }
        }

        fn releases(&self) -> Vec<String> {
            self.releases.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EngineClient for PagedClient {
        async fn search(&self, request: &SearchRequest) -> Result<SearchPage, SearchError> {
            if request.query.expression() == "{" {
                return Err(SearchError::query("failed to parse query"));
            }
            let total = self.pages.lock().unwrap().iter().map(Vec::len).sum::<usize>() as u64;
            Ok(SearchPage {
                documents: self.next_page(),
                cursor: CursorHandle::new("cursor-1"),
                total,
            })
        }

        async fn scroll_next(
            &self,
            cursor: &CursorHandle,
            _keep_alive: &str,
        ) -> Result<ScrollPage, SearchError> {
            if self.fail_scroll {
                return Err(SearchError::connection("connection reset"));
            }
            if !self.releases().is_empty() {
                return Err(SearchError::cursor(format!("No search context for {}", cursor)));
            }
            let documents = self.next_page();
            let has_more = !self.pages.lock().unwrap().is_empty();
            Ok(ScrollPage {
                documents,
                has_more,
            })
        }

        async fn release_cursor(&self, cursor: &CursorHandle) -> Result<(), SearchError> {
            if !self.release_latency.is_zero() {
                tokio::time::sleep(self.release_latency).await;
            }
            self.releases.lock().unwrap().push(cursor.as_str().to_string());
            Ok(())
        }

        async fn bulk(&self, _batch: &Batch) -> Result<BulkResponse, SearchError> {
            unimplemented!()
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

    fn partition(query: &str) -> Partition {
        Partition::new(Query::new(query), "beam", PartitionBounds::Whole)
    }

    async fn open(client: &Arc<PagedClient>) -> ScrollIterator {
        ScrollIterator::open(client.clone(), partition(Query::MATCH_ALL), &ReadConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_reads_all_pages_then_releases_once() {
        let client = Arc::new(PagedClient::new(&[3, 3, 2]));
        let mut iterator = open(&client).await;
        assert_eq!(iterator.total(), 8);

        let mut seen = Vec::new();
        while let Some(page) = iterator.advance().await.unwrap() {
            seen.extend(page.into_iter().map(|d| d.id));
        }

        assert_eq!(seen, (1..=8).map(|n| n.to_string()).collect::<Vec<_>>());
        assert!(iterator.is_exhausted());
        assert_eq!(client.releases(), vec!["cursor-1"]);

        // Exhaustion is sticky and does not release again
        assert!(iterator.advance().await.unwrap().is_none());
        drop(iterator);
        tokio::task::yield_now().await;
        assert_eq!(client.releases().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_first_page_releases_immediately() {
        let client = Arc::new(PagedClient::new(&[]));
        let mut iterator = open(&client).await;

        assert_eq!(client.releases().len(), 1);
        assert!(iterator.advance().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_query_fails_open() {
        let client = Arc::new(PagedClient::new(&[1]));
        let err = ScrollIterator::open(client.clone(), partition("{"), &ReadConfig::default())
            .await
            .unwrap_err();

        assert!(err.is_query());
        assert!(client.releases().is_empty());
    }

    #[tokio::test]
    async fn test_explicit_release() {
        let client = Arc::new(PagedClient::new(&[2, 2]));
        let mut iterator = open(&client).await;
        iterator.advance().await.unwrap();

        iterator.release().await.unwrap();
        assert_eq!(client.releases().len(), 1);

        let err = iterator.advance().await.unwrap_err();
        assert!(err.is_state());

        iterator.release().await.unwrap();
        drop(iterator);
        tokio::task::yield_now().await;
        assert_eq!(client.releases().len(), 1);
    }

    #[tokio::test]
    async fn test_drop_releases_from_spawned_task() {
        let client = Arc::new(PagedClient::new(&[2, 2, 2]));
        let iterator = open(&client).await;
        drop(iterator);

        for _ in 0..50 {
            if !client.releases().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(client.releases(), vec!["cursor-1"]);
    }

    #[tokio::test]
    async fn test_scroll_error_releases_and_propagates() {
        let mut client = PagedClient::new(&[1, 1]);
        client.fail_scroll = true;
        let client = Arc::new(client);
        let mut iterator = open(&client).await;

        assert!(iterator.advance().await.unwrap().is_some());
        assert!(iterator.advance().await.unwrap_err().is_connection());
        assert_eq!(client.releases().len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_release_is_retried_on_drop() {
        let mut client = PagedClient::new(&[1]);
        client.release_latency = Duration::from_millis(50);
        let client = Arc::new(client);
        let mut iterator = open(&client).await;
        assert!(iterator.advance().await.unwrap().is_some());

        // The next advance exhausts the scroll and starts a slow release
        let advanced = tokio::time::timeout(Duration::from_millis(5), iterator.advance()).await;
        assert!(advanced.is_err());
        assert!(client.releases().is_empty());

        drop(iterator);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(client.releases(), vec!["cursor-1"]);
    }

    #[tokio::test]
    async fn test_stream_and_next_document() {
        let client = Arc::new(PagedClient::new(&[2, 1]));
        let ids: Vec<String> = open(&client)
            .await
            .into_stream()
            .map(|d| d.unwrap().id)
            .collect()
            .await;
        assert_eq!(ids, vec!["1", "2", "3"]);

        let client = Arc::new(PagedClient::new(&[1, 2]));
        let mut iterator = open(&client).await;
        let mut count = 0;
        while iterator.next_document().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
    }
}
