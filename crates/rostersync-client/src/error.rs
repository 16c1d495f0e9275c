//! Session-level errors.

use crate::transport::TransportError;

/// Why a roster session stopped.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    /// Too many consecutive connection failures; start a new session to retry
    #[error("gave up after {failures} consecutive failures: {last_error}")]
    RetryExhausted {
        /// Consecutive failures observed
        failures: u32,
        /// Error from the final attempt
        last_error: TransportError,
    },
    /// The dispatcher task panicked or was aborted
    #[error("session task failed: {0}")]
    Task(String),
}
