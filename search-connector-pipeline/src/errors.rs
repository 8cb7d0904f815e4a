//! Error types for the search connector pipeline.

use search_connector_repository::SearchError;
use thiserror::Error;

use crate::write::ItemFailure;

/// Errors that can occur in the read and write pipelines.
#[derive(Error, Debug)]
pub enum ConnectorError {
    /// Error from the search engine.
    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    /// Some items of the written record set were rejected.
    #[error(
        "Partial bulk failure: {failed} of {total} items failed",
        total = .acknowledged + .failed
    )]
    PartialBulkFailure {
        /// Items that were rejected or never acknowledged.
        failed: usize,
        /// Items the engine acknowledged.
        acknowledged: usize,
        /// Every rejected item, with its reason.
        failures: Vec<ItemFailure>,
    },

    /// Operation invoked in the wrong lifecycle state (after close, on a
    /// released cursor).
    #[error("State error: {0}")]
    StateError(String),

    /// Invalid input or configuration.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// A pending submission was abandoned because the dispatcher shut down.
    #[error("Operation cancelled")]
    Cancelled,
}

impl ConnectorError {
    /// Create a state error.
    pub fn state(msg: impl Into<String>) -> Self {
        Self::StateError(msg.into())
    }

    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }

    /// Whether the engine could not be reached.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Search(e) if e.is_connection())
    }

    /// Whether the query was rejected.
    pub fn is_query(&self) -> bool {
        matches!(self, Self::Search(e) if e.is_query())
    }

    /// Whether the operation was invoked in the wrong lifecycle state.
    pub fn is_state(&self) -> bool {
        matches!(
            self,
            Self::StateError(_) | Self::Cancelled | Self::Search(SearchError::CursorError(_))
        )
    }

    /// Build the error reported when a written record set was only partly
    /// acknowledged.
    pub fn partial_failure(acknowledged: usize, failures: Vec<ItemFailure>) -> Self {
        Self::PartialBulkFailure {
            failed: failures.len(),
            acknowledged,
            failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use search_connector_shared::IndexTarget;

    #[test]
    fn test_classification() {
        assert!(ConnectorError::from(SearchError::connection("refused")).is_connection());
        assert!(ConnectorError::from(SearchError::query("bad")).is_query());
        assert!(ConnectorError::state("closed").is_state());
        assert!(ConnectorError::from(SearchError::cursor("gone")).is_state());
        assert!(!ConnectorError::validation("empty").is_state());
    }

    #[test]
    fn test_partial_failure_display() {
        let err = ConnectorError::PartialBulkFailure {
            failed: 2,
            acknowledged: 8,
            failures: vec![
                ItemFailure {
                    batch_id: 1,
                    position: 0,
                    target: IndexTarget::new("beam", "test"),
                    status: Some(400),
                    reason: "mapper_parsing_exception".to_string(),
                },
                ItemFailure {
                    batch_id: 1,
                    position: 3,
                    target: IndexTarget::new("beam", "test"),
                    status: None,
                    reason: "Connection error".to_string(),
                },
            ],
        };
        assert_eq!(err.to_string(), "Partial bulk failure: 2 of 10 items failed");
    }
}
