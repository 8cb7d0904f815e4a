//! Dependency initialization and wiring for the connector.

use std::sync::Arc;
use tracing::info;

use super::ConnectorConfig;
use crate::AppError;
use search_connector_pipeline::{BulkWriter, SearchReader};
use search_connector_repository::{EngineClient, OpenSearchClient};

/// Container for the initialized engine client and its configuration.
pub struct Dependencies {
    pub config: ConnectorConfig,
    client: Arc<dyn EngineClient>,
}

impl Dependencies {
    /// Connect to the engine described by `config`.
    ///
    /// # Returns
    ///
    /// * `Ok(Dependencies)` - The engine is reachable and not red
    /// * `Err(AppError)` - Invalid configuration or unhealthy engine
    pub async fn new(config: ConnectorConfig) -> Result<Self, AppError> {
        config.validate()?;

        info!(
            address = %config.address,
            index = %config.index,
            "Initializing dependencies"
        );

        let client = OpenSearchClient::new(config.client_config())
            .map_err(|e| AppError::config(format!("Failed to create OpenSearch client: {}", e)))?;

        Self::with_client(config, Arc::new(client)).await
    }

    /// Wire the connector around an existing engine client.
    pub async fn with_client(
        config: ConnectorConfig,
        client: Arc<dyn EngineClient>,
    ) -> Result<Self, AppError> {
        let healthy = client
            .health_check()
            .await
            .map_err(|e| AppError::config(format!("Engine health check failed: {}", e)))?;

        if !healthy {
            return Err(AppError::config("Search cluster is unhealthy"));
        }

        info!("Engine connection verified");
        Ok(Self { config, client })
    }

    pub fn reader(&self) -> SearchReader {
        SearchReader::new(self.client.clone(), self.config.read_config())
    }

    /// A new writer. Must be called inside the runtime.
    pub fn writer(&self) -> BulkWriter {
        BulkWriter::new(self.client.clone(), self.config.writer_config())
    }
}
