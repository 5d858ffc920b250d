//! Error types for multiplexer operations

use thiserror::Error;

/// Result type alias for multiplexer operations
pub type Result<T> = std::result::Result<T, FmuxError>;

/// Errors that can occur while driving a service or its I/O
#[derive(Debug, Error)]
pub enum FmuxError {
    /// The deadline passed before any work was handled
    #[error("Deadline expired after {waited_ms}ms")]
    TimedOut {
        /// Wall time spent waiting, in milliseconds
        waited_ms: u64,
    },

    /// The service was driven from a thread that does not own it
    #[error("Service is owned by another thread")]
    WrongThread,

    /// A deadline could not be interpreted
    #[error("Invalid deadline: {reason}")]
    InvalidDeadline {
        /// Why the deadline was rejected
        reason: String,
    },

    /// The operation was cancelled before it ran to completion
    #[error("Operation cancelled")]
    Cancelled,

    /// I/O error from the host platform
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// A raw OS call failed
    #[error("{call} failed: errno {errno}")]
    Os {
        /// Name of the failing call
        call: &'static str,
        /// The errno value it reported
        errno: i32,
    },

    /// A resource needed at construction time could not be acquired
    #[error("Resource exhausted: {reason}")]
    Exhausted {
        /// Reason for failure
        reason: String,
    },

    /// The service is in a state that forbids the operation
    #[error("Service in invalid state: {state}")]
    InvalidState {
        /// Current state description
        state: String,
    },
}

impl FmuxError {
    /// Create a timed-out error from a wait duration
    pub fn timed_out(waited: std::time::Duration) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let waited_ms = waited.as_millis() as u64;
        Self::TimedOut { waited_ms }
    }

    /// Create an invalid deadline error
    pub fn invalid_deadline(reason: impl Into<String>) -> Self {
        Self::InvalidDeadline {
            reason: reason.into(),
        }
    }

    /// Create an OS call error from the current `errno`
    pub fn last_os(call: &'static str) -> Self {
        Self::Os {
            call,
            errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
        }
    }

    /// Create an OS call error from an explicit errno value
    pub const fn os(call: &'static str, errno: i32) -> Self {
        Self::Os { call, errno }
    }

    /// Create a resource exhausted error
    pub fn exhausted(reason: impl Into<String>) -> Self {
        Self::Exhausted {
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(state: impl Into<String>) -> Self {
        Self::InvalidState {
            state: state.into(),
        }
    }

    /// True if this error is deadline expiry
    #[must_use]
    pub const fn is_timed_out(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timed_out_carries_wait() {
        let err = FmuxError::timed_out(std::time::Duration::from_millis(150));
        assert!(err.is_timed_out());
        assert_eq!(err.to_string(), "Deadline expired after 150ms");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::from(std::io::ErrorKind::NotFound);
        let err = FmuxError::from(io);
        assert!(matches!(err, FmuxError::Io { .. }));
    }
}
