//! Records and the targets they are written to.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An opaque serialized document payload.
///
/// The connector never inspects the payload; it is handed to the engine as
/// is. Cloning is cheap, the bytes are shared.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Record(Arc<[u8]>);

impl Record {
    /// Create a record from raw payload bytes.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self(Arc::from(payload.into()))
    }

    /// Serialize a JSON value into a record.
    pub fn from_json(value: &Value) -> Self {
        Self::new(value.to_string())
    }

    /// The raw payload bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The payload as UTF-8 text, if it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    /// Parse the payload as JSON.
    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_slice(&self.0)
    }

    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const PREVIEW: usize = 64;
        let text = String::from_utf8_lossy(&self.0);
        if text.len() > PREVIEW {
            let cut = (0..=PREVIEW).rev().find(|i| text.is_char_boundary(*i)).unwrap_or(0);
            write!(f, "Record({:?}.. {} bytes)", &text[..cut], self.0.len())
        } else {
            write!(f, "Record({:?})", text)
        }
    }
}

impl From<String> for Record {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for Record {
    fn from(value: &str) -> Self {
        Self::new(value.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for Record {
    fn from(value: Vec<u8>) -> Self {
        Self::new(value)
    }
}

/// Identifies where a record is written.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexTarget {
    /// Target index name.
    pub index: String,
    /// Document type. Engines without mapping types ignore it.
    pub doc_type: String,
    /// Explicit document id; the engine generates one when absent.
    pub id: Option<String>,
}

impl IndexTarget {
    /// Default document type used when none is configured.
    pub const DEFAULT_DOC_TYPE: &'static str = "_doc";

    /// Create a target for the given index and type with a generated id.
    pub fn new(index: impl Into<String>, doc_type: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            doc_type: doc_type.into(),
            id: None,
        }
    }

    /// Set an explicit document id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}
