//! OpenSearch request bodies and response parsing.
//!
//! Everything here is pure: building JSON bodies from connector types and
//! turning engine responses back into them. The client only does the I/O.

use opensearch::http::request::JsonBody;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::errors::SearchError;
use crate::types::{BulkItemError, BulkResponse, CursorHandle, SearchPage};
use search_connector_shared::{Batch, Document, PartitionBounds, Query, Record};

/// Parse a query expression into the engine's query object.
pub fn parse_query(query: &Query) -> Result<Value, SearchError> {
    let value: Value = serde_json::from_str(query.expression())
        .map_err(|e| SearchError::query(format!("Malformed query expression: {}", e)))?;

    if !value.is_object() {
        return Err(SearchError::query(
            "Query expression must be a JSON object",
        ));
    }

    Ok(value)
}

/// Build the body of the initial scroll search.
///
/// Results are sorted by `_doc`, the cheapest order for a scroll. Slice
/// bounds are expressed as a sliced scroll; shard bounds are routed with a
/// preference parameter instead (see [`preference`]).
pub fn search_body(query: &Query, bounds: PartitionBounds) -> Result<Value, SearchError> {
    let mut body = json!({
        "query": parse_query(query)?,
        "sort": ["_doc"],
    });

    if let Some(fields) = query.fields() {
        body["_source"] = json!(fields);
    }

    if let PartitionBounds::Slice { id, max } = bounds {
        body["slice"] = json!({ "id": id, "max": max });
    }

    Ok(body)
}

/// Build the body of a count request.
pub fn count_body(query: &Query) -> Result<Value, SearchError> {
    Ok(json!({ "query": parse_query(query)? }))
}

/// Shard routing preference for a partition, if it targets a single shard.
pub fn preference(bounds: PartitionBounds) -> Option<String> {
    match bounds {
        PartitionBounds::Shard(shard) => Some(format!("_shards:{}", shard)),
        PartitionBounds::Whole | PartitionBounds::Slice { .. } => None,
    }
}

/// Share of `total` documents that falls in slice `id` of `max`.
///
/// The count API cannot be sliced, so slice estimates split the total evenly.
pub fn slice_share(total: u64, id: u32, max: u32) -> u64 {
    if max == 0 {
        return total;
    }
    let max = u64::from(max);
    let base = total / max;
    if u64::from(id) < total % max {
        base + 1
    } else {
        base
    }
}

/// A bulk request body ready to send.
pub struct BulkBody {
    /// NDJSON lines: an action line followed by the source for every item.
    pub lines: Vec<JsonBody<Value>>,
    /// Batch positions of the items present in `lines`, in order.
    pub sent: Vec<usize>,
    /// Items rejected before sending (payload is not valid JSON).
    pub rejected: Vec<BulkItemError>,
}

/// Build the NDJSON body of a bulk index request.
///
/// The document type is not sent: OpenSearch has no mapping types.
pub fn bulk_body(batch: &Batch) -> BulkBody {
    let mut lines = Vec::with_capacity(batch.len() * 2);
    let mut sent = Vec::with_capacity(batch.len());
    let mut rejected = Vec::new();

    for (position, item) in batch.items().iter().enumerate() {
        let source = match item.record.to_json() {
            Ok(source) => source,
            Err(e) => {
                rejected.push(BulkItemError::new(
                    position,
                    Some(400),
                    format!("Record is not valid JSON: {}", e),
                ));
                continue;
            }
        };

        let mut action = json!({ "_index": item.target.index });
        if let Some(ref id) = item.target.id {
            action["_id"] = json!(id);
        }

        lines.push(json!({ "index": action }).into());
        lines.push(source.into());
        sent.push(position);
    }

    BulkBody {
        lines,
        sent,
        rejected,
    }
}

/// Reconcile a bulk response with the positions that were sent.
///
/// Items missing from the response are reported as failures.
pub fn parse_bulk_response(response: &Value, sent: &[usize]) -> BulkResponse {
    let empty = Vec::new();
    let items = response
        .get("items")
        .and_then(Value::as_array)
        .unwrap_or(&empty);

    let mut result = BulkResponse::default();

    for (i, position) in sent.iter().copied().enumerate() {
        let Some(item) = items.get(i) else {
            result.failures.push(BulkItemError::new(
                position,
                None,
                "Item missing from bulk response",
            ));
            continue;
        };

        // Each item is keyed by its action name ("index", "create", ...).
        let outcome = item
            .as_object()
            .and_then(|object| object.values().next())
            .unwrap_or(&Value::Null);

        let status = outcome
            .get("status")
            .and_then(Value::as_u64)
            .map(|status| status as u16);

        match outcome.get("error") {
            Some(error) => result.failures.push(BulkItemError::new(
                position,
                status,
                describe_error(error),
            )),
            None if status.map_or(false, |status| status >= 300) => {
                result.failures.push(BulkItemError::new(
                    position,
                    status,
                    "Item rejected without error details",
                ))
            }
            None => result.acknowledged += 1,
        }
    }

    result
}

/// Parse the first page of a scroll search.
pub fn parse_search_page(response: &Value, index: &str) -> Result<SearchPage, SearchError> {
    let cursor = response
        .get("_scroll_id")
        .and_then(Value::as_str)
        .ok_or_else(|| SearchError::parse("Search response has no _scroll_id"))?;

    Ok(SearchPage {
        documents: parse_hits(response, index)?,
        cursor: CursorHandle::new(cursor),
        total: parse_total(response),
    })
}

/// Parse the hits of a search or scroll response.
pub fn parse_hits(response: &Value, index: &str) -> Result<Vec<Document>, SearchError> {
    let hits = response
        .get("hits")
        .and_then(|hits| hits.get("hits"))
        .and_then(Value::as_array)
        .ok_or_else(|| SearchError::parse("Response has no hits array"))?;

    hits.iter()
        .map(|hit| {
            let id = hit
                .get("_id")
                .and_then(Value::as_str)
                .ok_or_else(|| SearchError::parse("Hit has no _id"))?;
            let hit_index = hit.get("_index").and_then(Value::as_str).unwrap_or(index);
            let source = hit.get("_source").cloned().unwrap_or_else(|| json!({}));

            Ok(Document::new(id, hit_index, Record::from_json(&source)))
        })
        .collect()
}

/// Total hit count; OpenSearch reports `{ "value": n }`, older engines a
/// bare number.
pub fn parse_total(response: &Value) -> u64 {
    let total = response.get("hits").and_then(|hits| hits.get("total"));
    match total {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(object) => object.get("value").and_then(Value::as_u64).unwrap_or(0),
        None => 0,
    }
}

/// Primary shard count from an index settings response.
///
/// An alias may resolve to several indices; the largest shard count is used
/// so that shard partitions cover every index behind it.
pub fn parse_shard_count(response: &Value) -> Result<u32, SearchError> {
    let indices = response
        .as_object()
        .ok_or_else(|| SearchError::parse("Settings response is not an object"))?;

    indices
        .values()
        .filter_map(|settings| {
            let shards = settings
                .get("settings")?
                .get("index")?
                .get("number_of_shards")?;
            match shards {
                Value::String(s) => s.parse::<u32>().ok(),
                Value::Number(n) => n.as_u64().map(|n| n as u32),
                _ => None,
            }
        })
        .max()
        .ok_or_else(|| SearchError::parse("Settings response has no number_of_shards"))
}

#[derive(Debug, Deserialize)]
struct ClusterHealth {
    status: String,
}

/// Health status reported by `_cluster/health`: `green`, `yellow` or `red`.
pub fn parse_cluster_status(response: Value) -> Result<String, SearchError> {
    let health: ClusterHealth = serde_json::from_value(response)
        .map_err(|e| SearchError::parse(format!("Invalid cluster health response: {}", e)))?;
    Ok(health.status)
}

/// Classify a non-success response.
pub fn classify_failure(
    status: u16,
    body: &str,
    fallback: fn(String) -> SearchError,
) -> SearchError {
    let error_type = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("error")
                .and_then(|error| error.get("type"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_default();

    let message = format!("status {}: {}", status, body);

    match (status, error_type.as_str()) {
        (404, "index_not_found_exception") => SearchError::IndexNotFound(message),
        (404, "search_context_missing_exception") => SearchError::CursorError(message),
        (400, _) => SearchError::QueryError(message),
        (429, _) | (502..=504, _) => SearchError::ConnectionError(message),
        _ => fallback(message),
    }
}

fn describe_error(error: &Value) -> String {
    let kind = error.get("type").and_then(Value::as_str);
    let reason = error.get("reason").and_then(Value::as_str);
    match (kind, reason) {
        (Some(kind), Some(reason)) => format!("{}: {}", kind, reason),
        (Some(kind), None) => kind.to_string(),
        (None, Some(reason)) => reason.to_string(),
        (None, None) => error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cluster_status() {
        let status = parse_cluster_status(json!({"cluster_name": "beam", "status": "yellow"}));
        assert_eq!(status.unwrap(), "yellow");

        let err = parse_cluster_status(json!({"cluster_name": "beam"})).unwrap_err();
        assert!(matches!(err, SearchError::ParseError(_)));
    }
    use search_connector_shared::{BulkItem, IndexTarget};

    fn batch(payloads: &[&str]) -> Batch {
        let items = payloads
            .iter()
            .map(|p| BulkItem::new(Record::from(*p), IndexTarget::new("beam", "test")))
            .collect();
        Batch::new(1, items)
    }

    #[test]
    fn test_search_body_match_all() {
        let body = search_body(&Query::match_all(), PartitionBounds::Whole).unwrap();

        assert!(body["query"]["match_all"].is_object());
        assert_eq!(body["sort"][0], "_doc");
        assert!(body.get("slice").is_none());
        assert!(body.get("_source").is_none());
    }

    #[test]
    fn test_search_body_slice_and_fields() {
        let query = Query::new(r#"{"match":{"scientist":"Einstein"}}"#).with_fields(["id"]);
        let body = search_body(&query, PartitionBounds::Slice { id: 1, max: 3 }).unwrap();

        assert_eq!(body["query"]["match"]["scientist"], "Einstein");
        assert_eq!(body["slice"]["id"], 1);
        assert_eq!(body["slice"]["max"], 3);
        assert_eq!(body["_source"][0], "id");
    }

    #[test]
    fn test_malformed_query() {
        let err = search_body(&Query::new("{\"match\": "), PartitionBounds::Whole).unwrap_err();
        assert!(matches!(err, SearchError::QueryError(_)));

        let err = parse_query(&Query::new("[1, 2]")).unwrap_err();
        assert!(matches!(err, SearchError::QueryError(_)));
    }

    #[test]
    fn test_preference() {
        assert_eq!(preference(PartitionBounds::Shard(3)).as_deref(), Some("_shards:3"));
        assert!(preference(PartitionBounds::Whole).is_none());
        assert!(preference(PartitionBounds::Slice { id: 0, max: 2 }).is_none());
    }

    #[test]
    fn test_slice_share_covers_total() {
        let total: u64 = (0..3).map(|id| slice_share(1000, id, 3)).sum();
        assert_eq!(total, 1000);
        assert_eq!(slice_share(1000, 0, 3), 334);
        assert_eq!(slice_share(1000, 2, 3), 333);
    }

    #[test]
    fn test_bulk_body_rejects_invalid_json_locally() {
        let body = bulk_body(&batch(&[r#"{"id":1}"#, "not json", r#"{"id":3}"#]));

        assert_eq!(body.lines.len(), 4);
        assert_eq!(body.sent, vec![0, 2]);
        assert_eq!(body.rejected.len(), 1);
        assert_eq!(body.rejected[0].position, 1);
    }

    #[test]
    fn test_parse_bulk_response_partial_failure() {
        let response = json!({
            "errors": true,
            "items": [
                { "index": { "_id": "a", "status": 201 } },
                { "index": { "_id": "b", "status": 400, "error": {
                    "type": "mapper_parsing_exception",
                    "reason": "failed to parse"
                } } },
            ]
        });

        let result = parse_bulk_response(&response, &[0, 2, 5]);

        assert_eq!(result.acknowledged, 1);
        assert_eq!(result.failures.len(), 2);
        assert_eq!(result.failures[0].position, 2);
        assert_eq!(result.failures[0].status, Some(400));
        assert_eq!(
            result.failures[0].reason,
            "mapper_parsing_exception: failed to parse"
        );
        assert_eq!(result.failures[1].position, 5);
        assert!(result.failures[1].status.is_none());
    }

    #[test]
    fn test_parse_search_page() {
        let response = json!({
            "_scroll_id": "scroll-1",
            "hits": {
                "total": { "value": 2, "relation": "eq" },
                "hits": [
                    { "_index": "beam", "_id": "1", "_source": { "scientist": "Bohr" } },
                    { "_id": "2", "_source": { "scientist": "Curie" } }
                ]
            }
        });

        let page = parse_search_page(&response, "beam").unwrap();

        assert_eq!(page.cursor.as_str(), "scroll-1");
        assert_eq!(page.total, 2);
        assert_eq!(page.documents.len(), 2);
        assert_eq!(page.documents[1].index, "beam");
        assert_eq!(page.documents[1].source.to_json().unwrap()["scientist"], "Curie");
    }

    #[test]
    fn test_parse_total_legacy() {
        assert_eq!(parse_total(&json!({ "hits": { "total": 42, "hits": [] } })), 42);
        assert_eq!(parse_total(&json!({})), 0);
    }

    #[test]
    fn test_parse_search_page_without_cursor() {
        let err = parse_search_page(&json!({ "hits": { "hits": [] } }), "beam").unwrap_err();
        assert!(matches!(err, SearchError::ParseError(_)));
    }

    #[test]
    fn test_parse_shard_count() {
        let response = json!({
            "beam-1": { "settings": { "index": { "number_of_shards": "3" } } },
            "beam-2": { "settings": { "index": { "number_of_shards": "5" } } }
        });
        assert_eq!(parse_shard_count(&response).unwrap(), 5);
        assert!(parse_shard_count(&json!({})).is_err());
    }

    #[test]
    fn test_classify_failure() {
        let body =
            r#"{"error":{"type":"index_not_found_exception","reason":"no such index [beam]"}}"#;
        assert!(matches!(
            classify_failure(404, body, SearchError::QueryError),
            SearchError::IndexNotFound(_)
        ));

        let body = r#"{"error":{"type":"search_context_missing_exception"}}"#;
        assert!(matches!(
            classify_failure(404, body, SearchError::QueryError),
            SearchError::CursorError(_)
        ));

        assert!(matches!(
            classify_failure(400, "{}", SearchError::BulkError),
            SearchError::QueryError(_)
        ));
        assert!(matches!(
            classify_failure(503, "", SearchError::QueryError),
            SearchError::ConnectionError(_)
        ));
        assert!(matches!(
            classify_failure(500, "", SearchError::BulkError),
            SearchError::BulkError(_)
        ));
    }
}
