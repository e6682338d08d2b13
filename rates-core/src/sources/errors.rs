//! Adapter error types

use thiserror::Error;

/// Result type for adapter operations
pub type FetchResult<T> = Result<T, FetchError>;

/// Failures an adapter may report for one fetch.
///
/// Every variant is recoverable: the coordinator keeps the source's
/// previous map and tries again next cycle.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("Network error: {message}")]
    Network { message: String },

    #[error("HTTP status {status}")]
    Http { status: u16 },

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Timeout after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Source unavailable: {message}")]
    Unavailable { message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ErrorKind {
    Transport,
    Payload,
    RateLimit,
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network { .. } | Self::Http { .. } | Self::Timeout { .. } | Self::Unavailable { .. } => {
                ErrorKind::Transport
            }
            Self::RateLimited => ErrorKind::RateLimit,
            Self::Parse(_) => ErrorKind::Payload,
        }
    }

    /// A malformed payload will not fix itself on an immediate retry
    pub fn should_retry(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Payload)
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout { seconds: 0 }
        } else if err.is_decode() {
            Self::Parse(err.to_string())
        } else if let Some(status) = err.status() {
            Self::Http { status: status.as_u16() }
        } else {
            Self::Network { message: err.to_string() }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_errors_are_not_retried() {
        assert!(!FetchError::Parse("bad".into()).should_retry());
        assert!(FetchError::RateLimited.should_retry());
        assert!(FetchError::Http { status: 503 }.should_retry());
    }

    #[test]
    fn test_json_error_converts_to_parse() {
        let err: FetchError = serde_json::from_str::<serde_json::Value>("{oops")
            .unwrap_err()
            .into();
        assert_eq!(err.kind(), ErrorKind::Payload);
    }
}
