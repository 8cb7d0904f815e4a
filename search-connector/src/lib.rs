//! # Search Connector
//!
//! Entry point and configuration for moving bounded record sets between a
//! data pipeline and an OpenSearch index.
//!
//! The binary reads a query's matches as NDJSON on stdout, or bulk-writes
//! NDJSON records from stdin.

pub mod config;

pub use config::{ConnectorConfig, Dependencies};

use thiserror::Error;

/// Errors that can occur while starting or running the connector.
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Read or write pipeline error.
    #[error("Pipeline error: {0}")]
    PipelineError(#[from] search_connector_pipeline::ConnectorError),

    /// Search engine error.
    #[error("Search error: {0}")]
    SearchError(#[from] search_connector_repository::SearchError),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl AppError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }
}
