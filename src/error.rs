//! Error types for Hoard.

use std::time::Duration;

use thiserror::Error;

/// Common error type for Hoard.
#[derive(Error, Debug)]
pub enum HoardError {
    /// Database error.
    ///
    /// Errors from sqlx are converted into this variant.
    #[error("database error: {0}")]
    Database(String),

    /// I/O error from the blob store or configuration files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed input, rejected before the store is touched.
    #[error("validation error: {0}")]
    Validation(String),

    /// Resource not found.
    #[error("{0} not found")]
    NotFound(String),

    /// The resolved permission is below what the operation requires.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A quota reservation did not fit under the user's ceiling.
    #[error("quota exceeded: requested {requested} bytes, {available} bytes available")]
    QuotaExceeded {
        /// Bytes the operation tried to reserve.
        requested: i64,
        /// Bytes still free at the time of the check.
        available: i64,
    },

    /// A content hash is already recorded with a different size.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// A folder move would make a folder its own ancestor.
    #[error("cycle error: {0}")]
    Cycle(String),

    /// The mutation governor rejected the call.
    #[error("rate limited: retry after {}ms", retry_after.as_millis())]
    RateLimited {
        /// Time until the current window expires.
        retry_after: Duration,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<sqlx::Error> for HoardError {
    fn from(e: sqlx::Error) -> Self {
        HoardError::Database(e.to_string())
    }
}

/// Result type alias for Hoard operations.
pub type Result<T> = std::result::Result<T, HoardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = HoardError::Validation("name is empty".to_string());
        assert_eq!(err.to_string(), "validation error: name is empty");
    }

    #[test]
    fn test_not_found_error_display() {
        let err = HoardError::NotFound("file".to_string());
        assert_eq!(err.to_string(), "file not found");
    }

    #[test]
    fn test_quota_exceeded_display() {
        let err = HoardError::QuotaExceeded {
            requested: 100,
            available: 40,
        };
        assert_eq!(
            err.to_string(),
            "quota exceeded: requested 100 bytes, 40 bytes available"
        );
    }

    #[test]
    fn test_rate_limited_display() {
        let err = HoardError::RateLimited {
            retry_after: Duration::from_millis(250),
        };
        assert_eq!(err.to_string(), "rate limited: retry after 250ms");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "blob missing");
        let err: HoardError = io_err.into();
        assert!(matches!(err, HoardError::Io(_)));
        assert!(err.to_string().contains("blob missing"));
    }

    #[test]
    fn test_sqlx_error_conversion() {
        let err: HoardError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, HoardError::Database(_)));
    }
}
