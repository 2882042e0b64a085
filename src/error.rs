use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Error taxonomy shared by every collector.
///
/// Each variant maps to one handling policy:
/// - TransientNetwork: retried with backoff, never fatal
/// - Protocol:         the single message is dropped, the stream continues
/// - RateLimit:        fixed delay, then the same request is retried
/// - Persistence:      logged + alerted, rest of the cycle skipped
/// - Configuration:    aborts startup, only before any collector runs
/// - Internal:         a collector task died (panic); the process stops
///
/// Everything raised inside a collection cycle is caught by the
/// collector core and converted into counters and alerts.
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("network error: {0}")]
    TransientNetwork(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("rate limited: {0}")]
    RateLimit(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Copyable discriminant of [`CollectorError`], used for logging and
/// alert routing without holding on to the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    TransientNetwork,
    Protocol,
    RateLimit,
    Persistence,
    Configuration,
    Internal,
}

impl CollectorError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CollectorError::TransientNetwork(_) => ErrorClass::TransientNetwork,
            CollectorError::Protocol(_) => ErrorClass::Protocol,
            CollectorError::RateLimit(_) => ErrorClass::RateLimit,
            CollectorError::Persistence(_) => ErrorClass::Persistence,
            CollectorError::Configuration(_) => ErrorClass::Configuration,
            CollectorError::Internal(_) => ErrorClass::Internal,
        }
    }

    /// Errors that stop the process instead of being retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CollectorError::Configuration(_) | CollectorError::Internal(_))
    }
}

impl From<reqwest::Error> for CollectorError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            CollectorError::Protocol(e.to_string())
        } else if e.status().map(|s| s.as_u16()) == Some(429) {
            CollectorError::RateLimit(e.to_string())
        } else {
            CollectorError::TransientNetwork(e.to_string())
        }
    }
}

impl From<tungstenite::Error> for CollectorError {
    fn from(e: tungstenite::Error) -> Self {
        CollectorError::TransientNetwork(e.to_string())
    }
}

impl From<serde_json::Error> for CollectorError {
    fn from(e: serde_json::Error) -> Self {
        CollectorError::Protocol(e.to_string())
    }
}

impl From<sqlx::Error> for CollectorError {
    fn from(e: sqlx::Error) -> Self {
        CollectorError::Persistence(e.to_string())
    }
}

impl From<redis::RedisError> for CollectorError {
    fn from(e: redis::RedisError) -> Self {
        CollectorError::TransientNetwork(format!("redis: {e}"))
    }
}

pub type CollectorResult<T> = Result<T, CollectorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_configuration_and_internal_errors_are_fatal() {
        assert!(CollectorError::Configuration("x".into()).is_fatal());
        assert!(CollectorError::Internal("x".into()).is_fatal());
        assert!(!CollectorError::TransientNetwork("x".into()).is_fatal());
        assert!(!CollectorError::Persistence("x".into()).is_fatal());
        assert!(!CollectorError::RateLimit("x".into()).is_fatal());
        assert!(!CollectorError::Protocol("x".into()).is_fatal());
    }

    #[test]
    fn json_errors_classify_as_protocol() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: CollectorError = err.into();
        assert_eq!(err.class(), ErrorClass::Protocol);
    }
}
