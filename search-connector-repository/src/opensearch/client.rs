//! OpenSearch client implementation.
//!
//! This module provides the concrete implementation of `EngineClient`
//! using the OpenSearch Rust client.

use async_trait::async_trait;
use opensearch::{
    cluster::ClusterHealthParts,
    http::response::Response,
    http::transport::{SingleNodeConnectionPool, TransportBuilder},
    indices::IndicesGetSettingsParts,
    BulkParts, ClearScrollParts, CountParts, OpenSearch, ScrollParts, SearchParts,
};
use serde_json::{json, Value};
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::config::EngineClientConfig;
use crate::errors::SearchError;
use crate::interfaces::EngineClient;
use crate::opensearch::requests;
use crate::types::{BulkResponse, CursorHandle, ScrollPage, SearchPage, SearchRequest};
use search_connector_shared::{Batch, PartitionBounds, Query};

/// OpenSearch client implementation.
///
/// Reads use scroll searches (optionally routed to one shard or sliced),
/// writes use the `_bulk` API with per-item error reporting.
///
/// # Example
///
/// ```ignore
/// let client = OpenSearchClient::new(EngineClientConfig::new("http://localhost:9200"))?;
/// let shards = client.shard_count("beam").await?;
/// ```
pub struct OpenSearchClient {
    client: OpenSearch,
    config: EngineClientConfig,
}

impl OpenSearchClient {
    /// Create a new OpenSearch client for the configured address.
    ///
    /// No request is made; use `health_check` to verify the engine is reachable.
    ///
    /// # Returns
    ///
    /// * `Ok(OpenSearchClient)` - A new client instance
    /// * `Err(SearchError)` - If the address is invalid or transport setup fails
    pub fn new(config: EngineClientConfig) -> Result<Self, SearchError> {
        let parsed_url =
            Url::parse(&config.address).map_err(|e| SearchError::connection(e.to_string()))?;

        let conn_pool = SingleNodeConnectionPool::new(parsed_url);
        let mut builder = TransportBuilder::new(conn_pool).disable_proxy();
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        let transport = builder
            .build()
            .map_err(|e| SearchError::connection(e.to_string()))?;

        info!(address = %config.address, "Created OpenSearch client");

        Ok(Self {
            client: OpenSearch::new(transport),
            config,
        })
    }

    /// The address this client talks to.
    pub fn address(&self) -> &str {
        &self.config.address
    }

    /// Read a JSON body from a response, classifying non-success statuses.
    async fn read_json(
        response: Response,
        fallback: fn(String) -> SearchError,
    ) -> Result<Value, SearchError> {
        let status = response.status_code();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Engine request failed");
            return Err(requests::classify_failure(status.as_u16(), &body, fallback));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| SearchError::parse(e.to_string()))
    }
}

#[async_trait]
impl EngineClient for OpenSearchClient {
    #[instrument(skip(self, request), fields(index = %request.index, bounds = %request.bounds))]
    async fn search(&self, request: &SearchRequest) -> Result<SearchPage, SearchError> {
        let body = requests::search_body(&request.query, request.bounds)?;
        let preference = requests::preference(request.bounds);
        let indices = [request.index.as_str()];

        let mut search = self
            .client
            .search(SearchParts::Index(&indices))
            .scroll(&request.keep_alive)
            .size(request.page_size as i64)
            .body(body);
        if let Some(ref preference) = preference {
            search = search.preference(preference);
        }

        let response = search
            .send()
            .await
            .map_err(|e| SearchError::connection(e.to_string()))?;
        let json = Self::read_json(response, SearchError::QueryError).await?;
        let page = requests::parse_search_page(&json, &request.index)?;

        debug!(
            cursor = %page.cursor,
            hits = page.documents.len(),
            total = page.total,
            "Opened scroll"
        );
        Ok(page)
    }

    async fn scroll_next(
        &self,
        cursor: &CursorHandle,
        keep_alive: &str,
    ) -> Result<ScrollPage, SearchError> {
        let response = self
            .client
            .scroll(ScrollParts::None)
            .body(json!({
                "scroll": keep_alive,
                "scroll_id": cursor.as_str()
            }))
            .send()
            .await
            .map_err(|e| SearchError::connection(e.to_string()))?;

        let json = Self::read_json(response, SearchError::CursorError).await?;
        let documents = requests::parse_hits(&json, "")?;
        let has_more = !documents.is_empty();

        Ok(ScrollPage {
            documents,
            has_more,
        })
    }

    async fn release_cursor(&self, cursor: &CursorHandle) -> Result<(), SearchError> {
        let response = self
            .client
            .clear_scroll(ClearScrollParts::None)
            .body(json!({ "scroll_id": [cursor.as_str()] }))
            .send()
            .await
            .map_err(|e| SearchError::connection(e.to_string()))?;

        let status = response.status_code();

        // 404 is acceptable - the lease may have expired or been cleared already
        if !status.is_success() && status.as_u16() != 404 {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, cursor = %cursor, "Clear scroll failed");
            return Err(requests::classify_failure(
                status.as_u16(),
                &body,
                SearchError::CursorError,
            ));
        }

        debug!(cursor = %cursor, "Released scroll");
        Ok(())
    }

    #[instrument(skip(self, batch), fields(batch_id = batch.id(), items = batch.len()))]
    async fn bulk(&self, batch: &Batch) -> Result<BulkResponse, SearchError> {
        let body = requests::bulk_body(batch);

        if body.sent.is_empty() {
            warn!(rejected = body.rejected.len(), "No valid items to send");
            return Ok(BulkResponse {
                acknowledged: 0,
                failures: body.rejected,
            });
        }

        let response = self
            .client
            .bulk(BulkParts::None)
            .body(body.lines)
            .send()
            .await
            .map_err(|e| SearchError::connection(e.to_string()))?;

        let json = Self::read_json(response, SearchError::BulkError).await?;
        let mut result = requests::parse_bulk_response(&json, &body.sent);
        result.failures.extend(body.rejected);
        result.failures.sort_by_key(|failure| failure.position);

        if result.has_failures() {
            warn!(
                acknowledged = result.acknowledged,
                failed = result.failures.len(),
                "Bulk request had item failures"
            );
        }
        Ok(result)
    }

    async fn shard_count(&self, index: &str) -> Result<u32, SearchError> {
        let indices = [index];
        let response = self
            .client
            .indices()
            .get_settings(IndicesGetSettingsParts::Index(&indices))
            .send()
            .await
            .map_err(|e| SearchError::connection(e.to_string()))?;

        let json = Self::read_json(response, SearchError::QueryError).await?;
        requests::parse_shard_count(&json)
    }

    async fn count(
        &self,
        query: &Query,
        index: &str,
        bounds: PartitionBounds,
    ) -> Result<u64, SearchError> {
        let body = requests::count_body(query)?;
        let preference = requests::preference(bounds);
        let indices = [index];

        let mut count = self.client.count(CountParts::Index(&indices)).body(body);
        if let Some(ref preference) = preference {
            count = count.preference(preference);
        }

        let response = count
            .send()
            .await
            .map_err(|e| SearchError::connection(e.to_string()))?;
        let json = Self::read_json(response, SearchError::QueryError).await?;
        let total = json
            .get("count")
            .and_then(Value::as_u64)
            .ok_or_else(|| SearchError::parse("Count response has no count"))?;

        Ok(match bounds {
            PartitionBounds::Slice { id, max } => requests::slice_share(total, id, max),
            PartitionBounds::Whole | PartitionBounds::Shard(_) => total,
        })
    }

    async fn health_check(&self) -> Result<bool, SearchError> {
        let response = self
            .client
            .cluster()
            .health(ClusterHealthParts::None)
            .send()
            .await
            .map_err(|e| SearchError::connection(e.to_string()))?;

        let json = Self::read_json(response, SearchError::ConnectionError).await?;
        let status = requests::parse_cluster_status(json)?;

        debug!(status = %status, "Cluster health");
        Ok(status != "red")
    }
}
