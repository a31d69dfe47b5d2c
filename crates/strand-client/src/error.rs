//! Errors surfaced to job submitters.

use thiserror::Error;

use strand_engine::EngineError;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur when submitting jobs to an engine.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The connection to the engine failed or ended early.
    #[error("connection error: {0}")]
    Connection(String),

    /// The engine reported the job as failed; the message is the handler's
    /// error text, verbatim.
    #[error("job failed: {0}")]
    Job(String),

    /// `start` was called on a job that is already past Created.
    #[error("job was already started")]
    AlreadyStarted,

    /// `wait` was called before `start`.
    #[error("job has not been started")]
    NotStarted,

    /// An engine-core error (transport, streams, codec).
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
