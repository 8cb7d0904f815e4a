//! # Search Connector Pipeline
//!
//! This crate moves bounded record sets between a data pipeline and the
//! search engine, in both directions.
//!
//! ## Write path
//!
//! 1. **Batcher**: accumulates records into batches by count and byte size
//! 2. **Dispatcher**: bounds in-flight bulk requests and drains them on close
//! 3. **Writer**: ties both together with a periodic flush
//!
//! ## Read path
//!
//! 1. **Planner**: splits a query into partitions by shard or slice
//! 2. **Scroll**: reads one partition through a server-side cursor
//! 3. **Reader**: merges the partition streams of a query

pub mod errors;
pub mod read;
pub mod write;

pub use errors::ConnectorError;
pub use read::{PartitionStrategy, ReadConfig, ReadPlanner, ScrollIterator, SearchReader};
pub use write::{
    BulkBatcher, BulkDispatcher, BulkWriter, DispatcherState, DrainSummary, ItemFailure,
    WriterConfig,
};
