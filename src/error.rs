use thiserror::Error;

use crate::TaskId;

/// Errors that can occur while talking to the broker or routing results.
#[derive(Error, Debug)]
pub enum BackendError {
    // ---
    /// Broker rejected an operation; retrying will not help.
    #[error("transport error: {0}")]
    Transport(String),

    /// Transient broker failure (refused connection, channel or connection
    /// closed mid-operation). Retried by [`RetryPolicy`](crate::RetryPolicy).
    #[error("transport error (retryable): {0}")]
    TransportRetryable(String),

    /// A broker call exceeded the configured per-call timeout.
    #[error("broker call timed out")]
    Timeout,

    /// Operation attempted on an explicitly closed connection or backend.
    #[error("closed: {0}")]
    ConnectionClosed(String),

    /// Graph tasks cannot use the direct reply-to result mode.
    #[error("graph unsupported: {0}")]
    GraphUnsupported(String),

    /// Results were popped for a task that did not request them.
    #[error("result not requested for task {0}")]
    ResultNotRequested(TaskId),

    /// The result slot was cleaned up while results were still awaited.
    #[error("result for task {0} expired")]
    ResultExpired(TaskId),

    /// A result arrived out of sequence.
    #[error("unexpected result index for task {task_id}: expected {expected}, got {got}")]
    UnexpectedIndex {
        task_id: TaskId,
        expected: u64,
        got: u64,
    },

    /// JSON serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration rejected by validation.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Broker URL could not be parsed.
    #[error("invalid broker url: {0}")]
    InvalidUrl(String),

    /// Unknown callback bucket or malformed registration.
    #[error("invalid callback: {0}")]
    InvalidCallback(String),
}

impl BackendError {
    /// Default exception filter: network-class failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        // ---
        matches!(
            self,
            BackendError::TransportRetryable(_) | BackendError::Timeout
        )
    }
}

/// Result type alias for backend operations
pub type Result<T> = std::result::Result<T, BackendError>;

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_retryable_classification() {
        // ---
        assert!(BackendError::Timeout.is_retryable());
        assert!(BackendError::TransportRetryable("refused".into()).is_retryable());
        assert!(!BackendError::Transport("404".into()).is_retryable());
        assert!(!BackendError::ConnectionClosed("backend".into()).is_retryable());
        assert!(!BackendError::ResultNotRequested(TaskId::generate()).is_retryable());
    }
}
