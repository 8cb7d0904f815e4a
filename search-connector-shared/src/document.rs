//! Documents returned by reads.

use crate::record::Record;

/// A document read from the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Engine document id.
    pub id: String,
    /// Index the document was read from.
    pub index: String,
    /// The document source, possibly filtered to the query's fields.
    pub source: Record,
}

impl Document {
    pub fn new(id: impl Into<String>, index: impl Into<String>, source: Record) -> Self {
        Self {
            id: id.into(),
            index: index.into(),
            source,
        }
    }

    /// Consume the document, keeping only its source.
    pub fn into_record(self) -> Record {
        self.source
    }
}
