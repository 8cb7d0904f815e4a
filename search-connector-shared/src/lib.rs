//! # Search Connector Shared
//!
//! Data model shared by the engine client, the read and write pipelines and
//! the mock engine: records and their write targets, queries and read
//! partitions, bulk batches and documents returned by a scroll.

mod batch;
mod document;
mod query;
mod record;

pub use batch::{Batch, BulkItem, ACTION_OVERHEAD_BYTES};
pub use document::Document;
pub use query::{Partition, PartitionBounds, Query};
pub use record::{IndexTarget, Record};
