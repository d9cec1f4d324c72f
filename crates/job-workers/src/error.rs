//! Error types for the job workers
//!
//! Every queue, worker and processor operation returns [`WorkerResult`].

use thiserror::Error;

/// Longest failure reason stored on a job
const MAX_REASON_LENGTH: usize = 1000;

/// Worker error types
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Redis connection or operation error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Error bubbled up from the shared library
    #[error(transparent)]
    Shared(#[from] shared::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Queue was never registered with the manager
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// Job not found
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Cron pattern or interval that cannot produce a next run
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// Transient delivery failure (transport error, 408, 429, 5xx)
    #[error("Delivery failed: {0}")]
    Delivery(String),

    /// Downstream rejected the job; retrying will not help
    #[error("Job rejected: {0}")]
    Rejected(String),

    /// Processing exceeded the job timeout
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Queue operation error
    #[error("Queue error: {0}")]
    Queue(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl WorkerError {
    /// Check if this error is retryable
    ///
    /// Transient errors (connection drops, timeouts, 5xx) are retryable.
    /// Permanent errors (invalid config, rejected payloads) are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkerError::Redis(_)
            | WorkerError::Delivery(_)
            | WorkerError::Timeout(_)
            | WorkerError::Queue(_) => true,
            WorkerError::Shared(e) => e.is_transient(),
            _ => false,
        }
    }

    pub fn invalid_config(details: impl Into<String>) -> Self {
        WorkerError::InvalidConfig(details.into())
    }

    pub fn queue_not_found(queue: impl Into<String>) -> Self {
        WorkerError::QueueNotFound(queue.into())
    }

    pub fn invalid_schedule(details: impl Into<String>) -> Self {
        WorkerError::InvalidSchedule(details.into())
    }

    pub fn delivery(details: impl Into<String>) -> Self {
        WorkerError::Delivery(details.into())
    }

    pub fn rejected(details: impl Into<String>) -> Self {
        WorkerError::Rejected(details.into())
    }

    pub fn timeout(details: impl Into<String>) -> Self {
        WorkerError::Timeout(details.into())
    }

    pub fn queue(details: impl Into<String>) -> Self {
        WorkerError::Queue(details.into())
    }

    /// Message stored as a job's `failed_reason`
    ///
    /// Single line, control characters removed, bounded length.
    pub fn failure_reason(&self) -> String {
        sanitize_reason(&self.to_string())
    }
}

fn sanitize_reason(msg: &str) -> String {
    msg.chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .take(MAX_REASON_LENGTH)
        .collect()
}

/// Convenience result type for worker operations
pub type WorkerResult<T> = Result<T, WorkerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(WorkerError::delivery("503 Service Unavailable").is_retryable());
        assert!(WorkerError::timeout("30s").is_retryable());
        assert!(WorkerError::queue("connection lost").is_retryable());
        assert!(WorkerError::Shared(shared::Error::timeout("ping")).is_retryable());

        assert!(!WorkerError::invalid_config("missing url").is_retryable());
        assert!(!WorkerError::rejected("400 Bad Request").is_retryable());
        assert!(!WorkerError::queue_not_found("video").is_retryable());
        assert!(!WorkerError::Shared(shared::Error::validation("bad")).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = WorkerError::queue_not_found("video");
        assert_eq!(err.to_string(), "Queue not found: video");

        let err = WorkerError::rejected("422 from webhook");
        assert_eq!(err.to_string(), "Job rejected: 422 from webhook");
    }

    #[test]
    fn test_from_json_error() {
        let json_err: serde_json::Error = serde_json::from_str::<String>("invalid").unwrap_err();
        let worker_err: WorkerError = json_err.into();
        assert!(!worker_err.is_retryable());
        assert!(matches!(worker_err, WorkerError::Serialization(_)));
    }

    #[test]
    fn test_redis_error_is_retryable() {
        let err = WorkerError::Redis(redis::RedisError::from((
            redis::ErrorKind::IoError,
            "Connection refused",
        )));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_failure_reason_is_single_line() {
        let err = WorkerError::delivery("line one\nline two");
        let reason = err.failure_reason();
        assert!(!reason.contains('\n'));
        assert!(reason.contains("line two"));
    }

    #[test]
    fn test_failure_reason_truncates() {
        let err = WorkerError::rejected("x".repeat(5000));
        assert_eq!(err.failure_reason().chars().count(), MAX_REASON_LENGTH);
    }
}
