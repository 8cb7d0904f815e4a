//! Search error types.
//!
//! This module defines the error types that can occur while talking to the
//! search engine.

use thiserror::Error;

/// Errors that can occur during search engine operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SearchError {
    /// The engine could not be reached or the transport failed.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The query was rejected by the engine.
    #[error("Query error: {0}")]
    QueryError(String),

    /// The target index does not exist.
    #[error("Index not found: {0}")]
    IndexNotFound(String),

    /// The cursor is unknown, expired or already released.
    #[error("Cursor error: {0}")]
    CursorError(String),

    /// The bulk request as a whole was rejected.
    #[error("Bulk error: {0}")]
    BulkError(String),

    /// Failed to parse a response from the engine.
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Failed to serialize data for the engine.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl SearchError {
    /// Create a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::ConnectionError(msg.into())
    }

    /// Create a query error.
    pub fn query(msg: impl Into<String>) -> Self {
        Self::QueryError(msg.into())
    }

    /// Create an index not found error.
    pub fn index_not_found(index: impl Into<String>) -> Self {
        Self::IndexNotFound(index.into())
    }

    /// Create a cursor error.
    pub fn cursor(msg: impl Into<String>) -> Self {
        Self::CursorError(msg.into())
    }

    /// Create a bulk error.
    pub fn bulk(msg: impl Into<String>) -> Self {
        Self::BulkError(msg.into())
    }

    /// Create a parse error.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::ParseError(msg.into())
    }

    /// Create a serialization error.
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::SerializationError(msg.into())
    }

    /// Whether the engine was unreachable.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::ConnectionError(_))
    }

    /// Whether the query itself was at fault.
    pub fn is_query(&self) -> bool {
        matches!(self, Self::QueryError(_) | Self::IndexNotFound(_))
    }
}

impl From<serde_json::Error> for SearchError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}
