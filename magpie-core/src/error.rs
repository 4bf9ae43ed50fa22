//! Error types for Magpie
//!
//! The error kinds form a closed set that callers match on explicitly:
//! transient infrastructure failures are retried locally, breaker
//! rejections fail fast, validation failures degrade, and partial batch
//! failures still carry a best-effort aggregate.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for Magpie operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for Magpie operations
#[derive(Error, Debug)]
pub enum Error {
    /// Retryable infrastructure failure (rate limit, timeout, connection)
    #[error("transient infrastructure error: {0}")]
    Transient(String),

    /// The circuit breaker for a dependency is open; the call was not made
    #[error("circuit breaker open for '{service}', retry in {}s", retry_in.as_secs())]
    BreakerOpen {
        /// Dependency the breaker guards
        service: String,
        /// Time until the next probe is admitted
        retry_in: Duration,
    },

    /// The breaker's state lock could not be acquired within the bounded wait
    #[error("circuit breaker unavailable for '{service}': state lock wait expired")]
    BreakerUnavailable {
        /// Dependency the breaker guards
        service: String,
    },

    /// Malformed or oversized input
    #[error("validation error: {0}")]
    Validation(String),

    /// Some fan-out items failed; the aggregate is still best-effort
    #[error("{failed_items} of {total_items} batch items failed")]
    PartialBatch {
        failed_items: usize,
        total_items: usize,
    },

    /// Storage backend error (ledger/cache persistence)
    #[error("storage error: {0}")]
    Storage(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for a transient failure
    pub fn transient(msg: impl Into<String>) -> Self {
        Error::Transient(msg.into())
    }

    /// Whether the local retry loop should attempt this error again.
    ///
    /// Breaker rejections are deliberately not retryable: the breaker has
    /// already decided the dependency should be left alone.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::transient("rate limited").is_transient());
        assert!(!Error::Validation("bad diff".to_string()).is_transient());
        assert!(!Error::BreakerOpen {
            service: "analysis".to_string(),
            retry_in: Duration::from_secs(30),
        }
        .is_transient());
        assert!(!Error::BreakerUnavailable {
            service: "analysis".to_string(),
        }
        .is_transient());
    }

    #[test]
    fn test_display_messages() {
        let err = Error::BreakerOpen {
            service: "analysis".to_string(),
            retry_in: Duration::from_secs(42),
        };
        let msg = err.to_string();
        assert!(msg.contains("analysis"));
        assert!(msg.contains("42"));

        let err = Error::PartialBatch {
            failed_items: 2,
            total_items: 20,
        };
        assert_eq!(err.to_string(), "2 of 20 batch items failed");
    }
}
