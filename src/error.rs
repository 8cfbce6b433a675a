//! Error types for Floodgate.

use thiserror::Error;

/// Main error type for Floodgate operations.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// The backing store could not be reached (connection refused or dropped,
    /// I/O failure, timeout). This is the only condition fail-open converts.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The store answered, but with an error
    #[error("Store error: {0}")]
    Store(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A policy definition is malformed
    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    /// No policy has been registered for the scope
    #[error("Unknown scope: {0}")]
    UnknownScope(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FloodgateError {
    /// Whether this error is the recoverable store-unavailable condition.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, FloodgateError::StoreUnavailable(_))
    }
}

impl From<redis::RedisError> for FloodgateError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_timeout()
        {
            FloodgateError::StoreUnavailable(err.to_string())
        } else {
            FloodgateError::Store(err.to_string())
        }
    }
}

impl From<config::ConfigError> for FloodgateError {
    fn from(err: config::ConfigError) -> Self {
        FloodgateError::Config(err.to_string())
    }
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_unavailable_classification() {
        assert!(FloodgateError::StoreUnavailable("refused".into()).is_store_unavailable());
        assert!(!FloodgateError::Store("WRONGTYPE".into()).is_store_unavailable());
        assert!(!FloodgateError::UnknownScope("x".into()).is_store_unavailable());
    }

    #[test]
    fn test_redis_io_error_is_unavailable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: FloodgateError = redis::RedisError::from(io).into();
        assert!(err.is_store_unavailable());
    }

    #[test]
    fn test_redis_response_error_is_not_unavailable() {
        let err: FloodgateError =
            redis::RedisError::from((redis::ErrorKind::TypeError, "wrong type")).into();
        assert!(matches!(err, FloodgateError::Store(_)));
    }
}
