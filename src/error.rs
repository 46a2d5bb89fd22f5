//! Error types for admission control.

use std::time::Duration;

use thiserror::Error;

/// Outcomes of an admission check that did not admit the request.
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// The configured limit has been reached for this request's key.
    ///
    /// Expected and recoverable; the middleware maps it to a throttling
    /// response and never logs it as a server fault.
    #[error("rate limit exceeded")]
    RateLimitExceeded {
        /// Hint for how long the client should back off, when the
        /// strategy can compute one.
        retry_after: Option<Duration>,
    },

    /// The distributed counter's store was unreachable or returned an error.
    #[error("counter backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A bounded wait for admission was aborted by the request context.
    #[error("admission wait cancelled")]
    Cancelled,

    /// Rejected at construction time; never surfaces during request handling.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

/// Result type alias for admission operations.
pub type Result<T> = std::result::Result<T, AdmissionError>;
