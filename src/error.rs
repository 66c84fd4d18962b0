//! Error types for the cache engines and pool
//!
//! Provides unified error handling using thiserror.

use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for every engine, the pool and the factory.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Malformed or unresolvable key, or an item that cannot be persisted
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The backend could not complete a physical operation
    #[error("Storage error: {0}")]
    Storage(String),

    /// Underlying file or OS error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Value could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Named configuration missing or invalid
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CacheError {
    /// Returns true for the InvalidArgument class of errors.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, CacheError::InvalidArgument(_))
    }

    /// Returns true for the StorageError class of errors.
    pub fn is_storage(&self) -> bool {
        matches!(self, CacheError::Storage(_))
    }
}

// == Result Type Alias ==
/// Convenience Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CacheError::InvalidArgument("Key 'x' not found in container".to_string());
        assert_eq!(
            err.to_string(),
            "Invalid argument: Key 'x' not found in container"
        );
        assert!(err.is_invalid_argument());
        assert!(!err.is_storage());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: CacheError = io.into();
        assert!(matches!(err, CacheError::Io(_)));
    }
}
