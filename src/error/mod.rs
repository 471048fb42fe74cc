//! Error types for replication operations
//!
//! Every fallible operation in the crate returns [`ReplicationError`]. Errors are
//! classified by [`ReplicationError::class`] so the unit task can decide between
//! retrying with backoff and settling the unit as failed.

pub mod handlers;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ReplicationError>;

#[derive(Debug, Error)]
pub enum ReplicationError {
    /// Connection resets, timeouts, throttling and 5xx responses
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// Rejected credentials or missing permissions
    #[error("Authentication error: {0}")]
    AuthFailure(String),

    /// Reconstructed content does not hash to the expected digest
    #[error("Integrity mismatch: expected {expected}, computed {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    /// Submission to a worker pool that is draining or stopped
    #[error("Worker pool is closed")]
    PoolClosed,

    /// Checkpoint storage could not be read or written
    #[error("Checkpoint unavailable: {0}")]
    CheckpointUnavailable(String),

    /// The operation observed a cancellation request
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Not found: {0}")]
    NotFound(String),

    /// Manifest, delta frame or blob content that cannot be interpreted
    #[error("Malformed content: {0}")]
    MalformedContent(String),

    /// Registry rejected a request for a reason retrying will not fix
    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Task panicked: {0}")]
    TaskPanicked(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// How the replicator should react to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with exponential backoff until the attempt ceiling
    Retryable,
    /// Retry a single additional time, then treat as terminal
    RetryOnce,
    /// Settle the unit as failed immediately
    Terminal,
}

impl ReplicationError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ReplicationError::TransientNetwork(_) => ErrorClass::Retryable,
            ReplicationError::Io(e) if is_transient_io(e) => ErrorClass::Retryable,
            ReplicationError::IntegrityMismatch { .. } => ErrorClass::RetryOnce,
            _ => ErrorClass::Terminal,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ReplicationError::Cancelled)
    }

    pub fn integrity(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        ReplicationError::IntegrityMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }
}

/// Stream failures while reading blob bodies; reqwest body errors surface as `Other`
fn is_transient_io(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        err.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::TimedOut
            | ErrorKind::UnexpectedEof
            | ErrorKind::Other
    )
}

impl From<reqwest::Error> for ReplicationError {
    fn from(err: reqwest::Error) -> Self {
        handlers::NetworkErrorHandler::handle_network_error(&err, "registry request")
    }
}

impl From<url::ParseError> for ReplicationError {
    fn from(err: url::ParseError) -> Self {
        ReplicationError::Configuration(format!("Invalid URL: {}", err))
    }
}

impl From<tokio::time::error::Elapsed> for ReplicationError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ReplicationError::TransientNetwork("registry call timed out".to_string())
    }
}
