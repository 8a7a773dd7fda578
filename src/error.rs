//! Error types for Floodgate.

use thiserror::Error;

/// Main error type for Floodgate operations.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// Invalid construction parameters or settings
    #[error("Configuration error: {0}")]
    Config(String),

    /// Caller key rejected before contacting the store
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Token cost must be at least one
    #[error("Invalid cost: {0} (must be at least 1)")]
    InvalidCost(u32),

    /// The store could not be reached or did not answer in time
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The store answered with data that is not a bucket state
    #[error("Store protocol error: {0}")]
    StoreProtocol(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FloodgateError {
    /// Whether this error originated from the backing store.
    ///
    /// Callers must check for errors before reading a decision; a store
    /// failure never degrades into an allow or a deny.
    pub fn is_store_error(&self) -> bool {
        matches!(
            self,
            FloodgateError::StoreUnavailable(_) | FloodgateError::StoreProtocol(_)
        )
    }
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_classification() {
        assert!(FloodgateError::StoreUnavailable("down".into()).is_store_error());
        assert!(FloodgateError::StoreProtocol("garbage".into()).is_store_error());
        assert!(!FloodgateError::Config("bad".into()).is_store_error());
        assert!(!FloodgateError::InvalidKey("empty".into()).is_store_error());
        assert!(!FloodgateError::InvalidCost(0).is_store_error());
    }

    #[test]
    fn test_error_display() {
        let err = FloodgateError::InvalidCost(0);
        assert_eq!(err.to_string(), "Invalid cost: 0 (must be at least 1)");

        let err = FloodgateError::StoreUnavailable("connection refused".into());
        assert_eq!(err.to_string(), "Store unavailable: connection refused");
    }
}
