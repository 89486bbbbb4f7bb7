//! Error types for the Turnstile service.

use thiserror::Error;

use crate::ratelimit::LimiterError;
use crate::store::StoreError;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Counter store errors outside of a limit check (connect, close)
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A limit check could not be completed
    #[error("Rate limit error: {0}")]
    Limiter(#[from] LimiterError),
}

impl From<config::ConfigError> for TurnstileError {
    fn from(err: config::ConfigError) -> Self {
        TurnstileError::Config(err.to_string())
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
