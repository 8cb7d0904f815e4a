//! Queries and read partitions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// An opaque serialized query expression with an optional field filter.
///
/// The expression is the engine's native query object, e.g.
/// `{"match": {"scientist": "Einstein"}}`. It is not validated here; a
/// malformed expression is reported by the engine when a read is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    expression: String,
    fields: Option<Vec<String>>,
}

impl Query {
    /// Expression matching every document.
    pub const MATCH_ALL: &'static str = r#"{"match_all":{}}"#;

    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            fields: None,
        }
    }

    pub fn match_all() -> Self {
        Self::new(Self::MATCH_ALL)
    }

    /// Restrict returned documents to the given source fields.
    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn fields(&self) -> Option<&[String]> {
        self.fields.as_deref()
    }
}

impl Default for Query {
    fn default() -> Self {
        Self::match_all()
    }
}

/// The part of an index a partition reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionBounds {
    /// The whole index.
    Whole,
    /// A single shard, routed by the engine.
    Shard(u32),
    /// One server-side scroll slice out of `max`.
    Slice { id: u32, max: u32 },
}

impl fmt::Display for PartitionBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Whole => write!(f, "whole"),
            Self::Shard(shard) => write!(f, "shard {}", shard),
            Self::Slice { id, max } => write!(f, "slice {}/{}", id, max),
        }
    }
}

/// A unit of parallel read work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub query: Query,
    pub index: String,
    pub bounds: PartitionBounds,
    /// Estimated number of matching documents; advisory only.
    pub estimated_count: Option<u64>,
}

impl Partition {
    pub fn new(query: Query, index: impl Into<String>, bounds: PartitionBounds) -> Self {
        Self {
            query,
            index: index.into(),
            bounds,
            estimated_count: None,
        }
    }

    pub fn with_estimated_count(mut self, count: u64) -> Self {
        self.estimated_count = Some(count);
        self
    }
}
