//! Error types surfaced by the broadcaster and consumer handles.
//!
//! Terminal results (close and kill payloads) are not errors: they arrive as a
//! normal [`Packet`](crate::Packet) with `done == true`. Errors are reserved for
//! liveness failures and misuse.

use std::time::Duration;
use thiserror::Error;

/// # Errors produced by stream operations.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A suspended read exceeded its deadline.
    ///
    /// Recoverable: the consumer keeps its position and may call `next()` again.
    #[error("consumer {id} iteration timed out after {timeout:?}")]
    Timeout {
        /// The consumer whose read timed out.
        id: u64,
        /// The deadline that was exceeded.
        timeout: Duration,
    },

    /// The referenced consumer is not in the registry.
    ///
    /// It may have reached a terminal result, detached, or been evicted as idle.
    #[error("unknown consumer {id}")]
    UnknownConsumer {
        /// The id that was looked up.
        id: u64,
    },

    /// Internal state was found inconsistent. Indicates a bug in this crate.
    #[error("invariant violated: {detail}")]
    InvariantViolation {
        /// What was found broken.
        detail: String,
    },
}

impl Error {
    /// Returns a short stable label (snake_case) for use in logs.
    ///
    /// # Example
    /// ```
    /// use skein::Error;
    ///
    /// let err = Error::UnknownConsumer { id: 3 };
    /// assert_eq!(err.as_label(), "unknown_consumer");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            Error::Timeout { .. } => "consumer_timeout",
            Error::UnknownConsumer { .. } => "unknown_consumer",
            Error::InvariantViolation { .. } => "invariant_violation",
        }
    }

    /// Whether calling `next()` again may succeed.
    ///
    /// Only [`Error::Timeout`] is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// Returns `true` for [`Error::Timeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}
