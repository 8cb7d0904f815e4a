//! Write path: batching, bounded dispatch and the writer that ties them
//! together.

mod batcher;
mod dispatcher;
mod writer;

pub use batcher::BulkBatcher;
pub use dispatcher::{BulkDispatcher, DispatcherState, DrainSummary, ItemFailure};
pub use writer::{BulkWriter, WriterConfig};
