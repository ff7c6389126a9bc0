//! Error taxonomy for staging operations.
//!
//! `Error` is what operations return; `ErrorKind` is the serializable
//! classification surfaced per failed chunk in a request's final status
//! report (best-effort policy keeps going and collects these).

use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad request — surfaced synchronously to the submitter, never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Link or endpoint failure. Retried with backoff, then escalated.
    #[error("transport failure on {endpoint}: {reason}")]
    Transport { endpoint: String, reason: String },

    /// A remote call exceeded its deadline. Retried bounded, then escalated.
    #[error("timed out after {millis}ms waiting for {what}")]
    Timeout { what: String, millis: u64 },

    /// The owning request was cancelled; observed at a suspension point.
    #[error("task cancelled")]
    Cancelled,

    /// Terminal task failure after retry exhaustion.
    #[error("task {task_index} of request {request_id} failed: {source}")]
    TaskFailed {
        request_id: u64,
        task_index: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The run queue or a worker channel is gone — daemon is shutting down.
    #[error("scheduler queue closed")]
    QueueClosed,
}

impl Error {
    /// Transient errors are retried at the task level; everything else
    /// escalates immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport { .. } | Error::Timeout { .. })
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::Transport { .. } => ErrorKind::Transport,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::TaskFailed { source, .. } => source.kind(),
            Error::Io { .. } => ErrorKind::Io,
            Error::QueueClosed => ErrorKind::Shutdown,
        }
    }
}

/// Classification of a chunk failure, reported in status responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Transport,
    Timeout,
    Cancelled,
    Io,
    Shutdown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Transport => "transport",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Io => "io",
            ErrorKind::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}
