//! Error types for the search connector repository.

mod search_error;

pub use search_error::SearchError;
