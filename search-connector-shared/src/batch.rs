//! Bulk batches.

use crate::record::{IndexTarget, Record};

/// Fixed per-action overhead added to a record's size when estimating the
/// byte size of a bulk request (action metadata line and separators).
pub const ACTION_OVERHEAD_BYTES: usize = 50;

/// A single index action inside a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkItem {
    pub record: Record,
    pub target: IndexTarget,
}

impl BulkItem {
    pub fn new(record: Record, target: IndexTarget) -> Self {
        Self { record, target }
    }

    /// Estimated contribution of this item to the bulk request size.
    pub fn estimated_size(&self) -> usize {
        self.record.len() + ACTION_OVERHEAD_BYTES
    }
}

/// An ordered, sealed sequence of index actions.
///
/// Batches are created by the batcher and are immutable afterwards: there is
/// no way to add, remove or reorder items once sealed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    id: u64,
    items: Vec<BulkItem>,
    size_in_bytes: usize,
}

impl Batch {
    /// Seal a batch from its items.
    pub fn new(id: u64, items: Vec<BulkItem>) -> Self {
        let size_in_bytes = items.iter().map(BulkItem::estimated_size).sum();
        Self {
            id,
            items,
            size_in_bytes,
        }
    }

    /// Execution id, unique per batcher and increasing in seal order.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn items(&self) -> &[BulkItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Estimated byte size of the bulk request carrying this batch.
    pub fn size_in_bytes(&self) -> usize {
        self.size_in_bytes
    }
}
