//! Error types for the overseer

use hive_shared::{codec::CodecError, error_code, MessageType};
use std::path::PathBuf;
use thiserror::Error;

/// Failures of a single session transport
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session closed")]
    Closed,

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of a request message queue
#[derive(Error, Debug)]
pub enum QueueError {
    /// Append after the stream already carried `error` or `choke`
    #[error("Append to a closed message queue")]
    Closed,

    #[error("Message queue was cancelled")]
    Cancelled,

    #[error("Message queue is already bound to a sink")]
    AlreadyBound,

    #[error("Sink rejected message: {0}")]
    Sink(#[from] SessionError),
}

/// Failures surfaced by a protocol handler; the session drops the
/// connection when it sees one
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("{dispatch} does not accept {message:?}")]
    Unexpected {
        dispatch: String,
        message: MessageType,
    },

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Overseer is shutting down")]
    OverseerGone,
}

/// Routing failures reported to the client that enqueued the request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OverseerError {
    #[error("Tagged routing not implemented: no drone serves tag '{tag}'")]
    NotImplemented { tag: String },

    #[error("Pending queue is full ({limit} requests)")]
    QueueFull { limit: usize },

    #[error("Drone {id} did not complete its handshake in time")]
    SpawnTimeout { id: String },

    #[error("Drone {id} could not be started: {reason}")]
    SpawnFailed { id: String, reason: String },

    #[error("Request waited too long for a drone")]
    RequestTimeout,

    #[error("Overseer is shutting down")]
    ShuttingDown,
}

impl OverseerError {
    /// Numeric code sent in the client-facing `error` message
    pub fn code(&self) -> i32 {
        match self {
            OverseerError::NotImplemented { .. } => error_code::NOT_IMPLEMENTED,
            OverseerError::QueueFull { .. } => error_code::QUEUE_FULL,
            OverseerError::SpawnTimeout { .. } => error_code::SPAWN_TIMEOUT,
            OverseerError::SpawnFailed { .. } => error_code::SPAWN_FAILED,
            OverseerError::RequestTimeout => error_code::REQUEST_TIMEOUT,
            OverseerError::ShuttingDown => error_code::SHUTTING_DOWN,
        }
    }

    /// Whether the client may retry the same request later
    pub fn is_retryable(&self) -> bool {
        !matches!(self, OverseerError::NotImplemented { .. })
    }
}

/// Failures of the process isolation backend
#[derive(Error, Debug)]
pub enum IsolateError {
    #[error("Drone executable not found: {0}")]
    MissingExecutable(PathBuf),

    #[error("Failed to start drone {id}: {source}")]
    Spawn {
        id: String,
        #[source]
        source: std::io::Error,
    },
}
