//! Error types for Turnstile.

use thiserror::Error;

/// Main error type for Turnstile operations.
///
/// Denial is never an error: an over-limit key is reported as `false`
/// from [`RateLimiter::allow`](crate::ratelimit::RateLimiter::allow).
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Invalid limiter parameters or unparsable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lookup of an endpoint family that has no configured limiter
    #[error("Unknown endpoint family: {0}")]
    UnknownFamily(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for TurnstileError {
    fn from(err: config::ConfigError) -> Self {
        TurnstileError::Config(err.to_string())
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
