use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Call log error: {0}")]
    Log(String),

    /// Credentials or endpoint settings are missing; raised before any attempt
    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Still failed after {attempts} attempts: {last}")]
    ExhaustedRetries { attempts: u32, last: AttemptError },

    #[error("Deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),
}

pub type Result<T> = std::result::Result<T, BrokerError>;

/// Why a single broker attempt did not produce an accepted reply.
///
/// These never leave the broker on their own; the retry loop either
/// consumes them or wraps the last one in [`BrokerError::ExhaustedRetries`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AttemptError {
    #[error("transport failure: {0}")]
    Transport(TransportError),

    #[error("structured decoding failed: {0}")]
    Decode(String),

    #[error("response rejected by validator: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Connection refused, DNS, timeouts and other request-level failures
    Network,
    /// The endpoint answered with a non-success status
    Status(u16),
    /// The endpoint answered but the body was not a usable completion
    Protocol,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn network(message: impl Into<String>) -> Self {
        Self { kind: TransportErrorKind::Network, message: message.into() }
    }

    pub fn status(code: u16, message: impl Into<String>) -> Self {
        Self { kind: TransportErrorKind::Status(code), message: message.into() }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self { kind: TransportErrorKind::Protocol, message: message.into() }
    }

    pub fn is_network(&self) -> bool {
        self.kind == TransportErrorKind::Network
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TransportErrorKind::Network => write!(f, "network error: {}", self.message),
            TransportErrorKind::Status(code) => write!(f, "API error {}: {}", code, self.message),
            TransportErrorKind::Protocol => write!(f, "unexpected response: {}", self.message),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() || e.is_request() {
            TransportError::network(e.to_string())
        } else if let Some(status) = e.status() {
            TransportError::status(status.as_u16(), e.to_string())
        } else {
            TransportError::protocol(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_retries_carries_last_cause() {
        let err = BrokerError::ExhaustedRetries {
            attempts: 5,
            last: AttemptError::Validation("missing field".to_string()),
        };
        let text = err.to_string();
        assert!(text.contains("5 attempts"));
        assert!(text.contains("missing field"));
    }

    #[test]
    fn test_transport_error_display() {
        assert_eq!(
            TransportError::status(429, "slow down").to_string(),
            "API error 429: slow down"
        );
        assert!(TransportError::network("refused").is_network());
        assert!(!TransportError::protocol("no choices").is_network());
    }
}
