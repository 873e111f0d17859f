//! Errors surfaced by the publisher.

use thiserror::Error;
use trackcast_env::{EnvError, ErrorInformation, FailureKind};

/// Publisher-level error, cloneable so one outcome can complete many callers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PublisherError {
    /// The publisher has been stopped
    #[error("Cannot perform this action when publisher is stopped")]
    Stopped,

    /// A collaborator call failed
    #[error("Transport error: {0}")]
    Transport(#[from] EnvError),

    /// The trackable was removed while it was still being added
    #[error("Trackable was removed before it finished being added")]
    RemoveRequested,

    /// Stop did not drain in-flight work in time
    #[error("Publisher did not stop within {0}ms")]
    StopTimeout(u64),

    /// An operation did not apply to the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A worker failed unexpectedly
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl PublisherError {
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn unexpected(msg: impl std::fmt::Display) -> Self {
        Self::Unexpected(msg.to_string())
    }

    /// Retry classification; only transport errors can be retriable.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            PublisherError::Transport(err) => err.failure_kind(),
            _ => FailureKind::NonRetriable,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.failure_kind() == FailureKind::Fatal
    }

    /// Error information for trackable states.
    pub fn error_information(&self) -> ErrorInformation {
        match self {
            PublisherError::Transport(err) => err.error_information(),
            other => ErrorInformation::internal(other.to_string()),
        }
    }
}

/// Result type for publisher operations.
pub type PublisherResult<T> = std::result::Result<T, PublisherError>;
