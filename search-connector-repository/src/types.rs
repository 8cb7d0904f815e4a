//! Request and response types for engine client operations.

use std::fmt;

use search_connector_shared::{Document, PartitionBounds, Query};

/// Default scroll keep-alive lease.
pub const DEFAULT_KEEP_ALIVE: &str = "5m";

/// Handle to a server-side scroll cursor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CursorHandle(String);

impl CursorHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CursorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Scroll ids are long base64 blobs; the prefix is enough to correlate logs.
        let end = self.0.char_indices().nth(16).map(|(i, _)| i).unwrap_or(self.0.len());
        write!(f, "{}", &self.0[..end])
    }
}

/// Initial search opening a scroll cursor.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: Query,
    pub index: String,
    pub bounds: PartitionBounds,
    /// Documents per page.
    pub page_size: usize,
    /// Cursor lease, in engine time units (e.g. `5m`).
    pub keep_alive: String,
}

impl SearchRequest {
    pub fn new(query: Query, index: impl Into<String>) -> Self {
        Self {
            query,
            index: index.into(),
            bounds: PartitionBounds::Whole,
            page_size: 100,
            keep_alive: DEFAULT_KEEP_ALIVE.to_string(),
        }
    }

    pub fn with_bounds(mut self, bounds: PartitionBounds) -> Self {
        self.bounds = bounds;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: impl Into<String>) -> Self {
        self.keep_alive = keep_alive.into();
        self
    }
}

/// First page of a scroll.
#[derive(Debug, Clone)]
pub struct SearchPage {
    pub documents: Vec<Document>,
    pub cursor: CursorHandle,
    /// Total hits reported by the engine for this search.
    pub total: u64,
}

/// A subsequent page of a scroll.
#[derive(Debug, Clone)]
pub struct ScrollPage {
    pub documents: Vec<Document>,
    /// False once the engine has nothing left for this cursor.
    pub has_more: bool,
}

/// A single item rejected within a bulk request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkItemError {
    /// Position of the item in the submitted batch.
    pub position: usize,
    /// Per-item HTTP-style status, when the engine reported one.
    pub status: Option<u16>,
    pub reason: String,
}

impl BulkItemError {
    pub fn new(position: usize, status: Option<u16>, reason: impl Into<String>) -> Self {
        Self {
            position,
            status,
            reason: reason.into(),
        }
    }
}

/// Outcome of a bulk request that reached the engine.
///
/// Items are reported in submission order: every position not listed in
/// `failures` and within the first `acknowledged + failures.len()` positions
/// was acknowledged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkResponse {
    pub acknowledged: usize,
    pub failures: Vec<BulkItemError>,
}

impl BulkResponse {
    /// A response acknowledging every item.
    pub fn all_acknowledged(count: usize) -> Self {
        Self {
            acknowledged: count,
            failures: Vec::new(),
        }
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}
