//! Error types shared by the context buffer and the request pipeline

use crate::api::retry::RetryCause;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, ContextError>;

/// Errors surfaced by the buffer, the client and the orchestrator
#[derive(Debug, Clone, Error)]
pub enum ContextError {
    #[error("No credential configured for provider '{0}'")]
    MissingCredential(String),

    #[error("Authentication rejected: {0}")]
    AuthFailure(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    #[error("Server error (status {status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("Transient network failure: {0}")]
    TransientNetwork(String),

    #[error("Parsing error: {0}")]
    ParsingError(String),

    #[error("Context overflow: need {needed} tokens, have {available} tokens")]
    ContextOverflow { needed: usize, available: usize },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Payload-free classification of a [`ContextError`].
///
/// This is what travels inside stream events and streaming results, where the
/// full error message is not needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MissingCredential,
    AuthFailure,
    RateLimitExceeded,
    ServerError,
    TransientNetwork,
    ParsingError,
    ContextOverflow,
    Cancelled,
    Configuration,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MissingCredential => "missing_credential",
            ErrorKind::AuthFailure => "auth_failure",
            ErrorKind::RateLimitExceeded => "rate_limit_exceeded",
            ErrorKind::ServerError => "server_error",
            ErrorKind::TransientNetwork => "transient_network",
            ErrorKind::ParsingError => "parsing_error",
            ErrorKind::ContextOverflow => "context_overflow",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ContextError {
    /// Classification used by stream events and results
    pub fn kind(&self) -> ErrorKind {
        match self {
            ContextError::MissingCredential(_) => ErrorKind::MissingCredential,
            ContextError::AuthFailure(_) => ErrorKind::AuthFailure,
            ContextError::RateLimitExceeded(_) => ErrorKind::RateLimitExceeded,
            ContextError::ServerError { .. } => ErrorKind::ServerError,
            ContextError::TransientNetwork(_) => ErrorKind::TransientNetwork,
            ContextError::ParsingError(_) => ErrorKind::ParsingError,
            ContextError::ContextOverflow { .. } => ErrorKind::ContextOverflow,
            ContextError::Cancelled => ErrorKind::Cancelled,
            ContextError::Configuration(_) => ErrorKind::Configuration,
            ContextError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Map this error onto the cause the retry policy reasons about
    pub fn retry_cause(&self) -> RetryCause {
        match self {
            ContextError::RateLimitExceeded(_) => RetryCause::RateLimited,
            ContextError::ServerError { .. } => RetryCause::ServerError,
            ContextError::TransientNetwork(_) => RetryCause::TransientNetwork,
            ContextError::AuthFailure(_) | ContextError::MissingCredential(_) => {
                RetryCause::AuthFailure
            }
            _ => RetryCause::Other,
        }
    }

    /// Build an error from a non-success HTTP status and its body
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 => ContextError::AuthFailure(body),
            429 => ContextError::RateLimitExceeded(body),
            500..=599 => ContextError::ServerError {
                status,
                message: body,
            },
            _ => ContextError::Internal(format!("Unexpected status {}: {}", status, body)),
        }
    }

    /// Classify a transport-level failure.
    ///
    /// Timeouts and connection failures are transient; a body that fails to
    /// decode is a parsing problem.
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_decode() {
            ContextError::ParsingError(err.to_string())
        } else if let Some(status) = err.status() {
            ContextError::from_status(status.as_u16(), err.to_string())
        } else {
            ContextError::TransientNetwork(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ContextError {
    fn from(err: serde_json::Error) -> Self {
        ContextError::ParsingError(err.to_string())
    }
}

impl From<::config::ConfigError> for ContextError {
    fn from(err: ::config::ConfigError) -> Self {
        ContextError::Configuration(err.to_string())
    }
}

impl From<prometheus::Error> for ContextError {
    fn from(err: prometheus::Error) -> Self {
        ContextError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            ContextError::from_status(401, String::new()),
            ContextError::AuthFailure(_)
        ));
        assert!(matches!(
            ContextError::from_status(429, String::new()),
            ContextError::RateLimitExceeded(_)
        ));
        assert!(matches!(
            ContextError::from_status(503, String::new()),
            ContextError::ServerError { status: 503, .. }
        ));
        assert_eq!(
            ContextError::from_status(404, String::new()).retry_cause(),
            RetryCause::Other
        );
    }

    #[test]
    fn test_retry_cause_classification() {
        assert_eq!(
            ContextError::RateLimitExceeded("slow down".into()).retry_cause(),
            RetryCause::RateLimited
        );
        assert_eq!(
            ContextError::TransientNetwork("reset".into()).retry_cause(),
            RetryCause::TransientNetwork
        );
        assert_eq!(
            ContextError::MissingCredential("anthropic".into()).retry_cause(),
            RetryCause::AuthFailure
        );
        assert_eq!(
            ContextError::ParsingError("bad json".into()).retry_cause(),
            RetryCause::Other
        );
    }

    #[test]
    fn test_overflow_message() {
        let err = ContextError::ContextOverflow {
            needed: 120,
            available: 100,
        };
        assert_eq!(err.kind(), ErrorKind::ContextOverflow);
        assert_eq!(
            err.to_string(),
            "Context overflow: need 120 tokens, have 100 tokens"
        );
    }
}
