//! In-process search engine for testing.
//!
//! This crate provides a single mock engine implementing
//! [`EngineClient`](search_connector_repository::EngineClient), so the read
//! and write pipelines can be exercised end to end without a cluster:
//!
//! ```text
//! BulkWriter ──bulk──▶ MockEngine ◀──search/scroll── SearchReader
//! ```
//!
//! The engine keeps documents in memory, routes them to shards by id,
//! evaluates a small subset of the query DSL (`match_all`, `match`, `term`,
//! `query_string`, `bool`) and hands out scroll cursors. It also records how
//! it was used (open cursors, release calls, concurrent bulk requests) and
//! can inject latency and failures.
//!
//! # Usage
//!
//! ```rust
//! use mock_search_engine::{fixtures, MockConfig, MockEngine};
//!
//! let engine = MockEngine::new(MockConfig::default().with_default_shards(3));
//! engine.create_index("beam", 3);
//! assert_eq!(engine.document_count("beam"), 0);
//!
//! let records = fixtures::scientist_records(20);
//! assert_eq!(records.len(), 20);
//! ```

mod engine;
pub mod fixtures;
mod query;

pub use engine::{MockConfig, MockEngine};
