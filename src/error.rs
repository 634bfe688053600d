//! Error types for Bulwark.

use std::time::Duration;

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Bulwark operations.
///
/// A request that is over its limit is never an error; see
/// [`RateResult`](crate::ratelimit::RateResult).
#[derive(Error, Debug)]
pub enum BulwarkError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// No identity could be derived for a request that requires limiting
    #[error("Configuration error: no identity for request to `{operation}`")]
    MissingIdentity { operation: String },

    /// The rate provider for an operation failed
    #[error("Configuration error: rate provider for `{operation}` failed: {reason}")]
    RateProvider { operation: String, reason: String },

    /// Layered settings could not be loaded
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    /// The counter store could not be reached or rejected the operation
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// The counter store did not answer in time
    #[error("Counter store timed out after {0:?}")]
    StoreTimeout(Duration),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BulwarkError {
    /// Whether this error stems from misconfiguration rather than a runtime fault.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            BulwarkError::Config(_)
                | BulwarkError::MissingIdentity { .. }
                | BulwarkError::RateProvider { .. }
                | BulwarkError::Settings(_)
        )
    }

    /// Whether this error means the counter store could not be consulted.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(
            self,
            BulwarkError::StoreUnavailable(_) | BulwarkError::StoreTimeout(_)
        )
    }
}

/// Result type alias for Bulwark operations.
pub type Result<T> = std::result::Result<T, BulwarkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = BulwarkError::MissingIdentity {
            operation: "orders.create".to_string(),
        };
        assert!(err.is_configuration());
        assert!(!err.is_store_unavailable());

        let err = BulwarkError::StoreTimeout(Duration::from_millis(250));
        assert!(err.is_store_unavailable());
        assert!(!err.is_configuration());

        let err = BulwarkError::from(StoreError::Connection("refused".to_string()));
        assert!(err.is_store_unavailable());
    }

    #[test]
    fn test_error_display() {
        let err = BulwarkError::RateProvider {
            operation: "orders.create".to_string(),
            reason: "tier lookup failed".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Configuration error: rate provider for `orders.create` failed: tier lookup failed"
        );
    }
}
