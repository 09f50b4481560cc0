//! # ShellCache Common
//!
//! Pieces shared by the cache crates: the configuration/timeout error,
//! subscriber setup for `tracing`, and the retry loop used while
//! precaching.

use std::time::Duration;
use thiserror::Error;

pub mod logging;
pub mod retry;

pub use logging::{init_logging, try_init_logging, LogConfig, LogFormat};
pub use retry::{retry_if, with_timeout, RetryConfig};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised outside the request path: bad configuration, logging
/// setup, and operations that ran out of time.
#[derive(Error, Debug)]
pub enum ShellCacheError {
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

impl ShellCacheError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Config error caused by a parse or resolution failure.
    pub fn config_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Short label for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            ShellCacheError::Config { .. } => "config",
            ShellCacheError::Timeout(_) => "timeout",
        }
    }
}
