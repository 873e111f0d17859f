//! Error types for the Trackcast environment abstraction.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error code used for failures raised inside the publisher rather than
/// reported by the transport.
pub const INTERNAL_ERROR_CODE: i32 = 100_000;

/// Structured failure details, as reported by the transport or synthesized
/// by the publisher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInformation {
    /// Service-specific error code
    pub code: i32,

    /// HTTP-like status code used for retry classification
    pub status_code: i32,

    /// Human readable message
    pub message: String,

    /// Link to documentation for the error, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,

    /// Underlying failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<ErrorInformation>>,
}

impl ErrorInformation {
    /// Creates error information with the given code and status.
    pub fn new(code: i32, status_code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            status_code,
            message: message.into(),
            href: None,
            cause: None,
        }
    }

    /// Error information for a failure raised by the publisher itself.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR_CODE, 0, message)
    }

    /// Attaches an underlying cause.
    pub fn with_cause(mut self, cause: ErrorInformation) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Classifies this failure by its status code.
    pub fn failure_kind(&self) -> FailureKind {
        FailureKind::from_status(self.status_code)
    }
}

impl std::fmt::Display for ErrorInformation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{} / {}] {}", self.code, self.status_code, self.message)
    }
}

/// Retry classification of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// 400-499: the request will never succeed, do not retry
    Fatal,

    /// 500-504: transient service-side failure, retry after a delay
    Retriable,

    /// Everything else: surfaced once, not retried
    NonRetriable,
}

impl FailureKind {
    /// Maps an HTTP-like status code to its retry class.
    pub fn from_status(status_code: i32) -> Self {
        match status_code {
            400..=499 => FailureKind::Fatal,
            500..=504 => FailureKind::Retriable,
            _ => FailureKind::NonRetriable,
        }
    }
}

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EnvError {
    /// Transport-level failure (connect, presence, publish)
    #[error("Connection error: {0}")]
    Connection(ErrorInformation),

    /// Payload serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Location provider failed (route calculation, trip start)
    #[error("Location provider error: {0}")]
    LocationProvider(String),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates a connection error.
    pub fn connection(code: i32, status_code: i32, msg: impl Into<String>) -> Self {
        Self::Connection(ErrorInformation::new(code, status_code, msg))
    }

    /// Creates a location provider error.
    pub fn location_provider(msg: impl std::fmt::Display) -> Self {
        Self::LocationProvider(msg.to_string())
    }

    /// Creates a timeout error.
    pub fn timeout(ms: u64) -> Self {
        Self::Timeout(ms)
    }

    /// Classifies this error for retry purposes.
    ///
    /// Only connection errors carry a status code; everything else is
    /// non-retriable.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            EnvError::Connection(info) => info.failure_kind(),
            _ => FailureKind::NonRetriable,
        }
    }

    /// Returns true if the error must not be retried.
    pub fn is_fatal(&self) -> bool {
        self.failure_kind() == FailureKind::Fatal
    }

    /// Converts this error into error information.
    pub fn error_information(&self) -> ErrorInformation {
        match self {
            EnvError::Connection(info) => info.clone(),
            other => ErrorInformation::internal(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for EnvError {
    fn from(err: serde_json::Error) -> Self {
        EnvError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_boundaries() {
        assert_eq!(FailureKind::from_status(399), FailureKind::NonRetriable);
        assert_eq!(FailureKind::from_status(400), FailureKind::Fatal);
        assert_eq!(FailureKind::from_status(499), FailureKind::Fatal);
        assert_eq!(FailureKind::from_status(500), FailureKind::Retriable);
        assert_eq!(FailureKind::from_status(504), FailureKind::Retriable);
        assert_eq!(FailureKind::from_status(505), FailureKind::NonRetriable);
        assert_eq!(FailureKind::from_status(0), FailureKind::NonRetriable);
    }

    #[test]
    fn test_non_connection_errors_are_not_fatal() {
        assert!(!EnvError::timeout(100).is_fatal());
        assert!(!EnvError::Serialization("bad".into()).is_fatal());
        assert!(EnvError::connection(40000, 401, "unauthorized").is_fatal());
    }

    #[test]
    fn test_internal_error_information() {
        let info = EnvError::timeout(250).error_information();
        assert_eq!(info.code, INTERNAL_ERROR_CODE);
        assert_eq!(info.status_code, 0);
        assert!(info.message.contains("250"));
    }
}
