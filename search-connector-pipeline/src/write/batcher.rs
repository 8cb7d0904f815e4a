//! Accumulates records into bounded bulk batches.

use search_connector_shared::{Batch, BulkItem, IndexTarget, Record, ACTION_OVERHEAD_BYTES};
use tracing::debug;

use crate::errors::ConnectorError;

/// Groups records into batches bounded by an action count and an estimated
/// request size.
///
/// A batch is sealed as soon as either threshold is reached, so a single
/// oversized record still forms a batch of its own.
#[derive(Debug)]
pub struct BulkBatcher {
    max_actions: usize,
    max_bytes: usize,
    current: Vec<BulkItem>,
    current_bytes: usize,
    next_id: u64,
}

impl BulkBatcher {
    pub fn new(max_actions: usize, max_bytes: usize) -> Self {
        Self {
            max_actions: max_actions.max(1),
            max_bytes: max_bytes.max(1),
            current: Vec::with_capacity(max_actions.clamp(1, 1024)),
            current_bytes: 0,
            next_id: 1,
        }
    }

    /// Append a record to the current batch.
    ///
    /// Returns the sealed batch when this record filled it.
    pub fn add(
        &mut self,
        record: Record,
        target: IndexTarget,
    ) -> Result<Option<Batch>, ConnectorError> {
        if record.is_empty() {
            return Err(ConnectorError::validation("Record payload is empty"));
        }
        if target.index.is_empty() {
            return Err(ConnectorError::validation("Target index name is empty"));
        }

        self.current_bytes += record.len() + ACTION_OVERHEAD_BYTES;
        self.current.push(BulkItem::new(record, target));

        if self.current.len() >= self.max_actions || self.current_bytes >= self.max_bytes {
            Ok(self.seal())
        } else {
            Ok(None)
        }
    }

    /// Seal the current batch regardless of its size.
    pub fn flush(&mut self) -> Option<Batch> {
        self.seal()
    }

    /// Number of records in the unsealed batch.
    pub fn pending(&self) -> usize {
        self.current.len()
    }

    /// Estimated request size of the unsealed batch.
    pub fn pending_bytes(&self) -> usize {
        self.current_bytes
    }

    fn seal(&mut self) -> Option<Batch> {
        if self.current.is_empty() {
            return None;
        }

        let items = std::mem::take(&mut self.current);
        self.current_bytes = 0;
        let id = self.next_id;
        self.next_id += 1;

        let batch = Batch::new(id, items);
        debug!(
            batch_id = id,
            items = batch.len(),
            bytes = batch.size_in_bytes(),
            "Sealed bulk batch"
        );
        Some(batch)
    }
}
