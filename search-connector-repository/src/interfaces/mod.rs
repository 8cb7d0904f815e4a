//! Interface definitions for the search engine client.
//!
//! This module defines the abstract `EngineClient` trait that allows for
//! dependency injection and swappable engine implementations.

mod engine_client;

pub use engine_client::EngineClient;
