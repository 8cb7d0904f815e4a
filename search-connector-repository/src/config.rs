//! Configuration types for engine clients.

use std::time::Duration;

/// Default engine address.
pub const DEFAULT_ADDRESS: &str = "http://localhost:9200";

/// Configuration for connecting to the search engine.
#[derive(Debug, Clone)]
pub struct EngineClientConfig {
    /// Engine endpoint, e.g. `http://localhost:9200`.
    pub address: String,
    /// Per-request timeout. `None` keeps the transport default.
    pub request_timeout: Option<Duration>,
}

impl Default for EngineClientConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            request_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl EngineClientConfig {
    /// Create a config for the given address with default settings.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    /// Set the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }
}
