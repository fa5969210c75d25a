//! Error types for each component.
//!
//! Store and publish errors carry the name of the operation that failed so a
//! log line is enough to tell which primitive broke.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),

    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Error)]
#[error("store operation '{operation}' failed: {message}")]
pub struct StoreError {
    pub operation: &'static str,
    pub message: String,
}

impl StoreError {
    pub fn new(operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            operation,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publish request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("topic rejected message with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("publish response was malformed: {0}")]
    MalformedResponse(String),

    #[error("publisher unavailable: {0}")]
    Unavailable(String),
}

/// What the webhook sender gets to see.
#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("internal error during {operation}: {message}")]
    Internal {
        operation: &'static str,
        message: String,
    },
}

impl From<StoreError> for ReceiverError {
    fn from(e: StoreError) -> Self {
        ReceiverError::Internal {
            operation: e.operation,
            message: e.message,
        }
    }
}

#[derive(Debug, Error)]
pub enum RetryDriverError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("a retry pass is already running")]
    AlreadyRunning,
}
