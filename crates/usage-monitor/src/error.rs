//! Error types for the usage monitor

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error(transparent)]
    Shared(#[from] shared::Error),

    /// A required INFO field was missing or not a number
    #[error("Invalid INFO reply: {0}")]
    InvalidInfo(String),

    #[error("Invalid threshold: {0}")]
    InvalidThreshold(String),
}

impl MonitorError {
    pub fn invalid_info(details: impl Into<String>) -> Self {
        Self::InvalidInfo(details.into())
    }

    pub fn invalid_threshold(details: impl Into<String>) -> Self {
        Self::InvalidThreshold(details.into())
    }
}

pub type MonitorResult<T> = Result<T, MonitorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            MonitorError::invalid_info("used_memory missing").to_string(),
            "Invalid INFO reply: used_memory missing"
        );
        let shared_err: MonitorError = shared::Error::config("bad").into();
        assert_eq!(shared_err.to_string(), "Configuration error: bad");
    }
}
