//! Error types for the sandbox engine

use thiserror::Error;
use uuid::Uuid;

/// Result type alias using the engine's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the sandbox engine
///
/// Script-level failures (compile, runtime, timeout) are never represented
/// here: they are data inside an `ExecutionResult`. This enum covers requests
/// that were never attempted and host-side plumbing failures.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The pool and its queue are both full
    #[error("Pool exhausted: {busy} workers busy and {queued}/{capacity} queue slots used, retry later")]
    PoolExhausted {
        busy: usize,
        queued: usize,
        capacity: usize,
    },

    /// The request was queued or in flight when the pool shut down
    #[error("Sandbox is shutting down: request {request_id} was not completed")]
    Shutdown { request_id: Uuid },

    /// The pool no longer accepts submissions
    #[error("Sandbox is not accepting new requests")]
    NotAccepting,

    /// A job queue is full
    #[error("Job queue is full ({0} jobs)")]
    QueueFull(usize),

    /// Isolate runtime error outside of script execution
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Worker thread error
    #[error("Worker error: {0}")]
    Worker(String),

    /// Capability error (host side)
    #[error("Capability error: {0}")]
    Capability(String),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::PoolExhausted { .. } | Error::QueueFull(_) | Error::Http(_) | Error::Timeout(_)
        )
    }

    /// Check if error is a client error (caller's fault)
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::InvalidInput(_) | Error::NotFound(_))
    }

    /// Check if error means the request was rejected for lack of capacity
    pub fn is_backpressure(&self) -> bool {
        matches!(self, Error::PoolExhausted { .. } | Error::QueueFull(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let exhausted = Error::PoolExhausted {
            busy: 2,
            queued: 0,
            capacity: 0,
        };
        assert!(exhausted.is_retryable());
        assert!(exhausted.is_backpressure());
        assert!(!exhausted.is_client_error());

        let shutdown = Error::Shutdown {
            request_id: Uuid::new_v4(),
        };
        assert!(!shutdown.is_retryable());

        assert!(Error::InvalidInput("bad".into()).is_client_error());
        assert!(Error::QueueFull(8).is_backpressure());
    }

    #[test]
    fn test_error_messages() {
        let err = Error::PoolExhausted {
            busy: 4,
            queued: 16,
            capacity: 16,
        };
        assert!(err.to_string().contains("retry later"));
    }
}
