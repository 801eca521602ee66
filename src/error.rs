//! Error types for Slotwarden.

use thiserror::Error;

/// Crate-level error for configuration and I/O.
#[derive(Error, Debug)]
pub enum SlotwardenError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Slotwarden operations.
pub type Result<T> = std::result::Result<T, SlotwardenError>;

/// Errors raised by a key-value store implementation.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store could not be read or written.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The requested locks were not obtained before the timeout.
    #[error("Timed out after {timeout_ms}ms acquiring lock on {keys:?}")]
    LockTimeout { keys: Vec<String>, timeout_ms: u64 },

    /// A stored record could not be decoded.
    #[error("Malformed stored record: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Errors returned by the rate limit governor.
#[derive(Error, Debug)]
pub enum GovernorError {
    /// Admission denied by an active suspension or a freshly crossed threshold.
    #[error("Rate limit exceeded for {subject}:{operation}, retry after {retry_after_ms}ms")]
    RateLimitExceeded {
        subject: String,
        operation: String,
        retry_after_ms: i64,
    },

    /// The per-key lock could not be obtained. The request was not admitted.
    #[error("Could not lock {subject}:{operation} within {timeout_ms}ms")]
    LockAcquisitionFailed {
        subject: String,
        operation: String,
        timeout_ms: u64,
    },

    /// The underlying key-value store failed.
    #[error("Key-value store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),

    /// The supplied window, suspension or limit cannot be enforced.
    #[error("Invalid rate limit policy: {0}")]
    InvalidPolicy(String),
}

impl From<StoreError> for GovernorError {
    fn from(err: StoreError) -> Self {
        GovernorError::StoreUnavailable(err)
    }
}

impl GovernorError {
    /// Whether this is an intended throttling decision.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, GovernorError::RateLimitExceeded { .. })
    }

    /// Whether this failure comes from the lock or the store rather than the limit.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            GovernorError::LockAcquisitionFailed { .. } | GovernorError::StoreUnavailable(_)
        )
    }
}
