//! Error types for table operations.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by table operations. Sample failures are delivered through
/// the sample callback; everything else is returned directly.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TableError {
    #[error("table '{name}' has been closed; no further inserts or samples are accepted")]
    /// The table was shut down while the operation was pending or submitted.
    Closed {
        /// Name of the closed table
        name: String,
    },

    #[error(
        "rate limiter timed out after {timeout:?}: table '{name}' never held enough items to sample"
    )]
    /// A queued sample request outlived its rate-limiter deadline.
    RateLimiterTimeout {
        /// Name of the table the request was queued on
        name: String,
        /// The deadline the request was given
        timeout: Duration,
    },
}

/// Result type alias for table operations.
pub type Result<T> = std::result::Result<T, TableError>;
