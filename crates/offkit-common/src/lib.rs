//! # Offkit Common
//!
//! Common utilities, error types, and logging configuration for the offkit
//! offline cache engine.
//!
//! ## Features
//!
//! - Unified error type
//! - Logging configuration and setup
//! - Retry and timeout utilities

use std::time::Duration;
use thiserror::Error;

pub mod logging;
pub mod retry;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry_with_backoff, with_timeout, RetryConfig};

/// Unified error type for offkit.
#[derive(Error, Debug)]
pub enum OffkitError {
    /// Cache storage errors.
    #[error("Storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration errors.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Timeout errors.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

impl OffkitError {
    /// Create a storage error with source.
    pub fn storage_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }
}

/// Result type alias for offkit operations.
pub type Result<T> = std::result::Result<T, OffkitError>;
