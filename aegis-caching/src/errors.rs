//! Cache error types

use thiserror::Error;

/// Result type for cache operations
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Cache-related errors
#[derive(Debug, Error)]
pub enum CacheError {
    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    /// Invalid configuration
    #[error("Invalid cache configuration: {0}")]
    InvalidConfiguration(String),

    /// Key pattern failed to compile
    #[error("Invalid key pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Persisted payload was written by a different format version
    #[error("Persisted cache format version {found} does not match expected {expected}")]
    VersionMismatch { expected: u32, found: u32 },

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            CacheError::DeserializationError(err.to_string())
        } else {
            CacheError::SerializationError(err.to_string())
        }
    }
}
