//! Shared infrastructure used across the server.

pub mod error;

pub use error::{BatchError, ErrorBand};

/// Result alias for request handlers and domain actions.
pub type Result<T> = std::result::Result<T, BatchError>;
