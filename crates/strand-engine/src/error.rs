//! Error types for the engine core.

use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Direction of a named stream end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    Read,
    Write,
}

impl std::fmt::Display for StreamDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamDirection::Read => write!(f, "read"),
            StreamDirection::Write => write!(f, "write"),
        }
    }
}

/// Errors that can occur in the engine core.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The requested job name has no registered handler.
    #[error("unknown job: {0}")]
    UnknownJob(String),

    /// The job name is registered but bound to the default stub.
    #[error("not yet implemented: {0}")]
    NotImplemented(String),

    /// A stream end was claimed twice.
    #[error("stream {name:?} already has a {dir} owner")]
    StreamClaimed {
        name: String,
        dir: StreamDirection,
    },

    /// A stream pump or drain task failed.
    #[error("stream task failed: {0}")]
    Stream(String),

    /// The connector has been closed; pending and future calls fail with this.
    #[error("connector is closed")]
    ConnectorClosed,

    /// `accept` was called on a connector that never bound a listener.
    #[error("connector is not listening")]
    NotListening,

    /// The peer sent something the protocol does not allow here.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Frame encoding or decoding failed.
    #[error("frame codec: {0}")]
    Codec(#[from] postcard::Error),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A job handler returned an error; propagated verbatim.
    #[error("{0}")]
    Job(#[from] anyhow::Error),
}
