//! # Search Connector Repository
//!
//! This crate provides the engine client contract used by the read and write
//! pipelines, the error types it reports, and a concrete implementation for
//! OpenSearch.

pub mod config;
pub mod errors;
pub mod interfaces;
pub mod opensearch;
pub mod types;

pub use config::EngineClientConfig;
pub use errors::SearchError;
pub use interfaces::EngineClient;
pub use opensearch::OpenSearchClient;
pub use types::{
    BulkItemError, BulkResponse, CursorHandle, ScrollPage, SearchPage, SearchRequest,
    DEFAULT_KEEP_ALIVE,
};
