//! The mock engine.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::query::{compile, Matcher};
use search_connector_repository::{
    BulkItemError, BulkResponse, CursorHandle, EngineClient, ScrollPage, SearchError, SearchPage,
    SearchRequest,
};
use search_connector_shared::{Batch, Document, PartitionBounds, Query, Record};

/// Configuration for the mock engine.
#[derive(Debug, Clone)]
pub struct MockConfig {
    /// Shard count of indices created implicitly by a bulk request.
    pub default_shards: u32,
    /// Time every bulk request takes before it is applied.
    pub bulk_latency: Option<Duration>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            default_shards: 1,
            bulk_latency: None,
        }
    }
}

impl MockConfig {
    /// Set the shard count of implicitly created indices.
    pub fn with_default_shards(mut self, shards: u32) -> Self {
        self.default_shards = shards.max(1);
        self
    }

    /// Delay every bulk request by `latency`.
    pub fn with_bulk_latency(mut self, latency: Duration) -> Self {
        self.bulk_latency = Some(latency);
        self
    }
}

#[derive(Debug, Clone)]
struct StoredDocument {
    id: String,
    shard: u32,
    source: Value,
}

#[derive(Debug)]
struct MockIndex {
    shards: u32,
    documents: Vec<StoredDocument>,
    positions: HashMap<String, usize>,
}

impl MockIndex {
    fn new(shards: u32) -> Self {
        Self {
            shards: shards.max(1),
            documents: Vec::new(),
            positions: HashMap::new(),
        }
    }

    fn upsert(&mut self, id: String, source: Value) {
        let shard = (route(&id, 0) % u64::from(self.shards)) as u32;
        let document = StoredDocument {
            id: id.clone(),
            shard,
            source,
        };
        match self.positions.get(&id) {
            Some(&position) => self.documents[position] = document,
            None => {
                self.positions.insert(id, self.documents.len());
                self.documents.push(document);
            }
        }
    }

    fn select<'a>(
        &'a self,
        matcher: &'a Matcher,
        bounds: PartitionBounds,
    ) -> impl Iterator<Item = &'a StoredDocument> + 'a {
        let shards = self.shards;
        // Shard order first, then insertion order, like a `_doc` sorted scroll.
        (0..shards)
            .flat_map(move |shard| self.documents.iter().filter(move |d| d.shard == shard))
            .filter(move |d| in_bounds(d, bounds))
            .filter(move |d| matcher.matches(&d.source))
    }

    fn validate(&self, bounds: PartitionBounds) -> Result<(), SearchError> {
        match bounds {
            PartitionBounds::Shard(shard) if shard >= self.shards => Err(SearchError::query(
                format!("No shard [{}] available, index has {} shards", shard, self.shards),
            )),
            PartitionBounds::Slice { id, max } if max == 0 || id >= max => Err(
                SearchError::query(format!("Invalid slice [{}/{}]", id, max)),
            ),
            _ => Ok(()),
        }
    }
}

#[derive(Debug)]
struct OpenCursor {
    page_size: usize,
    remaining: VecDeque<Document>,
}

#[derive(Debug, Default)]
struct EngineState {
    indices: HashMap<String, MockIndex>,
    cursors: HashMap<String, OpenCursor>,
    next_cursor: u64,
    unreachable: bool,
    failing_bulk_requests: usize,
    rejections: Vec<(String, Value)>,
}

/// An in-process search engine.
///
/// All state lives behind a mutex that is never held across an await point,
/// so the engine can be shared freely between tasks as an
/// `Arc<dyn EngineClient>`.
#[derive(Debug)]
pub struct MockEngine {
    config: MockConfig,
    state: Mutex<EngineState>,
    release_calls: AtomicUsize,
    bulk_requests: AtomicUsize,
    active_bulk_requests: AtomicUsize,
    max_active_bulk_requests: AtomicUsize,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new(MockConfig::default())
    }
}

impl MockEngine {
    /// Create an empty engine.
    pub fn new(config: MockConfig) -> Self {
        Self {
            config,
            state: Mutex::new(EngineState::default()),
            release_calls: AtomicUsize::new(0),
            bulk_requests: AtomicUsize::new(0),
            active_bulk_requests: AtomicUsize::new(0),
            max_active_bulk_requests: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        // A panicking test thread must not hide the engine state from others.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_reachable(&self) -> Result<(), SearchError> {
        if self.state().unreachable {
            return Err(SearchError::connection("Connection refused"));
        }
        Ok(())
    }

    /// Create (or recreate, empty) an index with the given shard count.
    pub fn create_index(&self, name: &str, shards: u32) {
        self.state()
            .indices
            .insert(name.to_string(), MockIndex::new(shards));
    }

    /// Number of documents stored in an index.
    pub fn document_count(&self, index: &str) -> usize {
        self.state()
            .indices
            .get(index)
            .map(|index| index.documents.len())
            .unwrap_or(0)
    }

    /// Sources of every document in an index, in insertion order.
    pub fn sources(&self, index: &str) -> Vec<Value> {
        self.state()
            .indices
            .get(index)
            .map(|index| index.documents.iter().map(|d| d.source.clone()).collect())
            .unwrap_or_default()
    }

    /// Make every request fail with a connection error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    /// Fail the next `count` bulk requests as a whole.
    pub fn fail_next_bulk_requests(&self, count: usize) {
        self.state().failing_bulk_requests = count;
    }

    /// Reject every indexed document whose `field` equals `value`.
    pub fn reject_documents_where(&self, field: &str, value: Value) {
        self.state().rejections.push((field.to_string(), value));
    }

    /// Number of cursors opened and not yet released.
    pub fn open_cursors(&self) -> usize {
        self.state().cursors.len()
    }

    /// Number of release calls received, including repeated ones.
    pub fn release_calls(&self) -> usize {
        self.release_calls.load(Ordering::SeqCst)
    }

    /// Number of bulk requests received.
    pub fn bulk_requests(&self) -> usize {
        self.bulk_requests.load(Ordering::SeqCst)
    }

    /// Highest number of bulk requests that were executing at the same time.
    pub fn max_concurrent_bulk_requests(&self) -> usize {
        self.max_active_bulk_requests.load(Ordering::SeqCst)
    }

    fn apply_bulk(&self, batch: &Batch) -> Result<BulkResponse, SearchError> {
        let mut state = self.state();

        if state.unreachable {
            return Err(SearchError::connection("Connection refused"));
        }
        if state.failing_bulk_requests > 0 {
            state.failing_bulk_requests -= 1;
            return Err(SearchError::connection("Connection reset by peer"));
        }

        let default_shards = self.config.default_shards;
        let mut response = BulkResponse::default();

        for (position, item) in batch.items().iter().enumerate() {
            let source = match item.record.to_json() {
                Ok(source @ Value::Object(_)) => source,
                _ => {
                    response.failures.push(BulkItemError::new(
                        position,
                        Some(400),
                        "mapper_parsing_exception: failed to parse",
                    ));
                    continue;
                }
            };

            let rejected = state
                .rejections
                .iter()
                .any(|(field, value)| source.get(field) == Some(value));
            if rejected {
                response.failures.push(BulkItemError::new(
                    position,
                    Some(400),
                    "document_parsing_exception: rejected by mock engine",
                ));
                continue;
            }

            let id = item
                .target
                .id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
            state
                .indices
                .entry(item.target.index.clone())
                .or_insert_with(|| MockIndex::new(default_shards))
                .upsert(id, source);
            response.acknowledged += 1;
        }

        Ok(response)
    }
}

#[async_trait]
impl EngineClient for MockEngine {
    async fn search(&self, request: &SearchRequest) -> Result<SearchPage, SearchError> {
        let mut state = self.state();
        if state.unreachable {
            return Err(SearchError::connection("Connection refused"));
        }

        let matcher = compile(request.query.expression())?;
        let index = state
            .indices
            .get(&request.index)
            .ok_or_else(|| SearchError::index_not_found(request.index.clone()))?;
        index.validate(request.bounds)?;

        let mut remaining: VecDeque<Document> = index
            .select(&matcher, request.bounds)
            .map(|d| {
                let source = project(&d.source, request.query.fields());
                Document::new(d.id.clone(), request.index.clone(), Record::from_json(&source))
            })
            .collect();

        let total = remaining.len() as u64;
        let page_size = request.page_size.max(1);
        let first_page: Vec<Document> = remaining
            .drain(..page_size.min(remaining.len()))
            .collect();

        state.next_cursor += 1;
        let cursor = CursorHandle::new(format!("mock-scroll-{}", state.next_cursor));
        state.cursors.insert(
            cursor.as_str().to_string(),
            OpenCursor {
                page_size,
                remaining,
            },
        );

        debug!(cursor = %cursor, total = total, bounds = %request.bounds, "Mock scroll opened");
        Ok(SearchPage {
            documents: first_page,
            cursor,
            total,
        })
    }

    async fn scroll_next(
        &self,
        cursor: &CursorHandle,
        _keep_alive: &str,
    ) -> Result<ScrollPage, SearchError> {
        let mut state = self.state();
        if state.unreachable {
            return Err(SearchError::connection("Connection refused"));
        }

        let open = state
            .cursors
            .get_mut(cursor.as_str())
            .ok_or_else(|| {
                SearchError::cursor(format!("No search context found for [{}]", cursor))
            })?;

        let take = open.page_size.min(open.remaining.len());
        let documents: Vec<Document> = open.remaining.drain(..take).collect();

        Ok(ScrollPage {
            documents,
            has_more: !open.remaining.is_empty(),
        })
    }

    async fn release_cursor(&self, cursor: &CursorHandle) -> Result<(), SearchError> {
        self.check_reachable()?;
        self.release_calls.fetch_add(1, Ordering::SeqCst);
        self.state().cursors.remove(cursor.as_str());
        Ok(())
    }

    async fn bulk(&self, batch: &Batch) -> Result<BulkResponse, SearchError> {
        self.bulk_requests.fetch_add(1, Ordering::SeqCst);
        let active = self.active_bulk_requests.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_bulk_requests.fetch_max(active, Ordering::SeqCst);

        if let Some(latency) = self.config.bulk_latency {
            tokio::time::sleep(latency).await;
        }

        let result = self.apply_bulk(batch);
        self.active_bulk_requests.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn shard_count(&self, index: &str) -> Result<u32, SearchError> {
        self.check_reachable()?;
        self.state()
            .indices
            .get(index)
            .map(|index| index.shards)
            .ok_or_else(|| SearchError::index_not_found(index))
    }

    async fn count(
        &self,
        query: &Query,
        index: &str,
        bounds: PartitionBounds,
    ) -> Result<u64, SearchError> {
        self.check_reachable()?;
        let matcher = compile(query.expression())?;
        let state = self.state();
        let index = state
            .indices
            .get(index)
            .ok_or_else(|| SearchError::index_not_found(index))?;
        index.validate(bounds)?;

        Ok(index.select(&matcher, bounds).count() as u64)
    }

    async fn health_check(&self) -> Result<bool, SearchError> {
        self.check_reachable()?;
        Ok(true)
    }
}

fn route(id: &str, salt: u64) -> u64 {
    let mut hasher = DefaultHasher::new();
    salt.hash(&mut hasher);
    id.hash(&mut hasher);
    hasher.finish()
}

fn in_bounds(document: &StoredDocument, bounds: PartitionBounds) -> bool {
    match bounds {
        PartitionBounds::Whole => true,
        PartitionBounds::Shard(shard) => document.shard == shard,
        PartitionBounds::Slice { id, max } => {
            route(&document.id, 1) % u64::from(max) == u64::from(id)
        }
    }
}

fn project(source: &Value, fields: Option<&[String]>) -> Value {
    let (Some(fields), Value::Object(object)) = (fields, source) else {
        return source.clone();
    };
    let projected: Map<String, Value> = object
        .iter()
        .filter(|(key, _)| fields.iter().any(|field| field == *key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    Value::Object(projected)
}
