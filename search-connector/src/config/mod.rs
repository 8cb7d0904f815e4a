//! Connector configuration, read from the environment.

mod dependencies;

pub use dependencies::Dependencies;

use std::env;
use std::str::FromStr;
use std::time::Duration;

use search_connector_pipeline::{PartitionStrategy, ReadConfig, WriterConfig};
use search_connector_repository::EngineClientConfig;
use search_connector_shared::{IndexTarget, Query};
use serde::Serialize;

use crate::AppError;

/// Complete connector configuration.
///
/// # Environment Variables
///
/// - `OPENSEARCH_URL`: engine address (default: http://localhost:9200)
/// - `SEARCH_INDEX`: index to read from or write to (required)
/// - `SEARCH_DOC_TYPE`: document type of written records (default: _doc)
/// - `SEARCH_QUERY`: query DSL for reads (default: match_all)
/// - `BULK_BATCH_SIZE`: max actions per bulk request (default: 100)
/// - `BULK_MAX_BYTES`: max bulk request size in bytes (default: 5 MB)
/// - `BULK_FLUSH_INTERVAL_MS`: partial batch flush interval, 0 disables (default: 5000)
/// - `BULK_CONCURRENT_REQUESTS`: max bulk requests in flight (default: 5)
/// - `SCROLL_PAGE_SIZE`: documents per scroll page (default: 100)
/// - `SCROLL_KEEP_ALIVE`: scroll lease (default: 5m)
/// - `READ_PARALLELISM`: desired read partitions (default: 1)
/// - `PARTITION_STRATEGY`: `shard_routing` or `sliced` (default: shard_routing)
/// - `REQUEST_TIMEOUT_MS`: per-request timeout (default: 30000)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectorConfig {
    pub address: String,
    pub index: String,
    pub doc_type: String,
    pub query: String,
    pub batch_size: usize,
    pub max_bulk_request_bytes: usize,
    pub flush_interval: Duration,
    pub concurrent_requests: usize,
    pub page_size: usize,
    pub keep_alive: String,
    pub parallelism: usize,
    pub partition_strategy: PartitionStrategy,
    pub request_timeout: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        let writer = WriterConfig::default();
        let read = ReadConfig::default();

        Self {
            address: EngineClientConfig::default().address,
            index: String::new(),
            doc_type: IndexTarget::DEFAULT_DOC_TYPE.to_string(),
            query: Query::MATCH_ALL.to_string(),
            batch_size: writer.batch_size,
            max_bulk_request_bytes: writer.max_bulk_request_bytes,
            flush_interval: writer.flush_interval.unwrap_or_default(),
            concurrent_requests: writer.concurrent_requests,
            page_size: read.page_size,
            keep_alive: read.keep_alive,
            parallelism: 1,
            partition_strategy: read.strategy,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl ConnectorConfig {
    /// Load the configuration from environment variables.
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load the configuration from any key lookup, falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let string = |key: &str, default: String| lookup(key).unwrap_or(default);

        Ok(Self {
            address: string("OPENSEARCH_URL", defaults.address),
            index: string("SEARCH_INDEX", defaults.index),
            doc_type: string("SEARCH_DOC_TYPE", defaults.doc_type),
            query: string("SEARCH_QUERY", defaults.query),
            batch_size: parse(&lookup, "BULK_BATCH_SIZE", defaults.batch_size)?,
            max_bulk_request_bytes: parse(
                &lookup,
                "BULK_MAX_BYTES",
                defaults.max_bulk_request_bytes,
            )?,
            flush_interval: millis(&lookup, "BULK_FLUSH_INTERVAL_MS", defaults.flush_interval)?,
            concurrent_requests: parse(
                &lookup,
                "BULK_CONCURRENT_REQUESTS",
                defaults.concurrent_requests,
            )?,
            page_size: parse(&lookup, "SCROLL_PAGE_SIZE", defaults.page_size)?,
            keep_alive: string("SCROLL_KEEP_ALIVE", defaults.keep_alive),
            parallelism: parse(&lookup, "READ_PARALLELISM", defaults.parallelism)?,
            partition_strategy: parse(&lookup, "PARTITION_STRATEGY", defaults.partition_strategy)?,
            request_timeout: millis(&lookup, "REQUEST_TIMEOUT_MS", defaults.request_timeout)?,
        })
    }

    /// Check the configuration before any connection is made.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.address.trim().is_empty() {
            return Err(AppError::config("Engine address is empty"));
        }
        if self.index.trim().is_empty() {
            return Err(AppError::config("Index name is empty (set SEARCH_INDEX)"));
        }
        if self.doc_type.trim().is_empty() {
            return Err(AppError::config("Document type is empty"));
        }

        let sizes = [
            ("batch_size", self.batch_size),
            ("max_bulk_request_bytes", self.max_bulk_request_bytes),
            ("concurrent_requests", self.concurrent_requests),
            ("page_size", self.page_size),
            ("parallelism", self.parallelism),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, value)| *value == 0) {
            return Err(AppError::config(format!("{} must be greater than zero", name)));
        }

        if self.keep_alive.trim().is_empty() {
            return Err(AppError::config("Scroll keep-alive is empty"));
        }
        Ok(())
    }

    pub fn client_config(&self) -> EngineClientConfig {
        EngineClientConfig::new(self.address.clone()).with_request_timeout(self.request_timeout)
    }

    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            batch_size: self.batch_size,
            max_bulk_request_bytes: self.max_bulk_request_bytes,
            flush_interval: (!self.flush_interval.is_zero()).then_some(self.flush_interval),
            concurrent_requests: self.concurrent_requests,
        }
    }

    pub fn read_config(&self) -> ReadConfig {
        ReadConfig {
            page_size: self.page_size,
            keep_alive: self.keep_alive.clone(),
            strategy: self.partition_strategy,
        }
    }

    /// Where written records go.
    pub fn target(&self) -> IndexTarget {
        IndexTarget::new(self.index.clone(), self.doc_type.clone())
    }

    pub fn query(&self) -> Query {
        Query::new(self.query.clone())
    }
}

fn parse<F, T>(lookup: &F, key: &str, default: T) -> Result<T, AppError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e| AppError::config(format!("Invalid {}={:?}: {}", key, value, e))),
        None => Ok(default),
    }
}

fn millis<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration, AppError>
where
    F: Fn(&str) -> Option<String>,
{
    let default = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse(lookup, key, default).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ConnectorConfig::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config.address, "http://localhost:9200");
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.concurrent_requests, 5);
        assert_eq!(config.max_bulk_request_bytes, 5 * 1024 * 1024);
        assert_eq!(config.flush_interval, Duration::from_secs(5));
        assert_eq!(config.page_size, 100);
        assert_eq!(config.keep_alive, "5m");
        assert_eq!(config.partition_strategy, PartitionStrategy::ShardRouting);
        assert_eq!(config.query, Query::MATCH_ALL);

        // The index has no default
        assert!(matches!(config.validate(), Err(AppError::ConfigError(_))));
    }

    #[test]
    fn test_overrides() {
        let config = ConnectorConfig::from_lookup(lookup(&[
            ("SEARCH_INDEX", "beam"),
            ("BULK_BATCH_SIZE", "250"),
            ("BULK_FLUSH_INTERVAL_MS", "0"),
            ("PARTITION_STRATEGY", "sliced"),
            ("READ_PARALLELISM", " 4 "),
        ]))
        .unwrap();

        config.validate().unwrap();
        assert_eq!(config.batch_size, 250);
        assert_eq!(config.parallelism, 4);
        assert_eq!(config.writer_config().flush_interval, None);
        assert_eq!(config.read_config().strategy, PartitionStrategy::Sliced);
        assert_eq!(config.target().index, "beam");
        assert_eq!(config.target().doc_type, "_doc");
    }

    #[test]
    fn test_invalid_values() {
        let err = ConnectorConfig::from_lookup(lookup(&[("BULK_BATCH_SIZE", "many")])).unwrap_err();
        assert!(err.to_string().contains("BULK_BATCH_SIZE"));

        let err =
            ConnectorConfig::from_lookup(lookup(&[("PARTITION_STRATEGY", "random")])).unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));

        let config = ConnectorConfig::from_lookup(lookup(&[
            ("SEARCH_INDEX", "beam"),
            ("BULK_CONCURRENT_REQUESTS", "0"),
        ]))
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("concurrent_requests"));
    }
}
