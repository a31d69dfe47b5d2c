//! One job invocation, caller side.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use strand_engine::wire::{self, Frame};
use strand_engine::{Connector, Streams};

use crate::error::{ClientError, ClientResult};

/// Lifecycle state of a [`Job`]. Transitions are monotonic:
/// Created → Running → {Succeeded, Failed}; no state is revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Created,
    Running,
    Succeeded,
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Created => write!(f, "created"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A named, argument-bearing invocation of a registered handler, with its
/// own stream set.
///
/// Attach drains ([`Streams::write_to`]) and sources ([`Streams::read_from`])
/// before [`Job::start`], call [`Job::wait`] for the terminal status, and
/// only then shut the streams down — shutting down earlier risks dropping
/// trailing output.
pub struct Job {
    name: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    streams: Streams,
    status: JobStatus,
    connector: Arc<dyn Connector>,
    frames_rx: Option<mpsc::Receiver<Frame>>,
    exit_rx: Option<oneshot::Receiver<Result<(), ClientError>>>,
    /// Failure message recorded at the terminal transition.
    failure: Option<String>,
    io_tasks: Vec<JoinHandle<()>>,
}

impl Job {
    pub(crate) fn new(connector: Arc<dyn Connector>, name: String, args: Vec<String>) -> Self {
        let (frames_tx, frames_rx) = mpsc::channel(32);
        Self {
            name,
            args,
            env: HashMap::new(),
            streams: Streams::new(frames_tx),
            status: JobStatus::Created,
            connector,
            frames_rx: Some(frames_rx),
            exit_rx: None,
            failure: None,
            io_tasks: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    /// Set an environment entry for the invocation. Only meaningful before
    /// [`Job::start`].
    pub fn set_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env.insert(key.into(), value.into());
    }

    /// The job's named stream set.
    pub fn streams(&self) -> &Streams {
        &self.streams
    }

    /// Open the connection, send the job request, and transition to
    /// Running. Calling `start` twice is a contract violation.
    pub async fn start(&mut self) -> ClientResult<()> {
        if self.status != JobStatus::Created {
            return Err(ClientError::AlreadyStarted);
        }
        let conn = self.connector.connect().await?;
        let (mut writer, mut reader) = wire::split(conn);
        writer
            .send(&Frame::Start {
                name: self.name.clone(),
                args: self.args.clone(),
                env: self.env.clone(),
                feeds: self.streams.outbound_names(),
            })
            .await?;

        let Some(mut frames_rx) = self.frames_rx.take() else {
            return Err(ClientError::AlreadyStarted);
        };
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = frames_rx.recv().await {
                if writer.send(&frame).await.is_err() {
                    break;
                }
            }
        });

        let streams = self.streams.clone();
        let (exit_tx, exit_rx) = oneshot::channel();
        let demux_task = tokio::spawn(async move {
            let outcome = loop {
                match reader.recv().await {
                    Ok(Some(Frame::Data { stream, data })) => streams.feed(&stream, data).await,
                    Ok(Some(Frame::Close { stream })) => streams.close_inbound(&stream),
                    Ok(Some(Frame::Exit { error })) => {
                        break match error {
                            None => Ok(()),
                            Some(message) => Err(ClientError::Job(message)),
                        }
                    }
                    Ok(Some(Frame::Start { .. })) => {
                        break Err(ClientError::Connection(
                            "unexpected job request from the engine".into(),
                        ))
                    }
                    Ok(None) => {
                        break Err(ClientError::Connection(
                            "connection closed before the job completed".into(),
                        ))
                    }
                    Err(e) => break Err(ClientError::Engine(e)),
                }
            };
            // All stream data for the job precedes Exit, so the drains can
            // run dry now.
            streams.close_all_inbound();
            let _ = exit_tx.send(outcome);
        });

        self.io_tasks.push(writer_task);
        self.io_tasks.push(demux_task);
        self.exit_rx = Some(exit_rx);
        self.status = JobStatus::Running;
        tracing::debug!(job = %self.name, "job started");
        Ok(())
    }

    /// Block until the engine reports completion; returns the stored error
    /// on failure. Calling `wait` before `start` is a contract violation.
    /// After the terminal transition, further calls return the recorded
    /// result.
    pub async fn wait(&mut self) -> ClientResult<()> {
        match self.status {
            JobStatus::Created => Err(ClientError::NotStarted),
            JobStatus::Succeeded => Ok(()),
            JobStatus::Failed => Err(ClientError::Job(
                self.failure.clone().unwrap_or_default(),
            )),
            JobStatus::Running => {
                let Some(exit_rx) = self.exit_rx.take() else {
                    return Err(ClientError::NotStarted);
                };
                let outcome = match exit_rx.await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(ClientError::Connection(
                        "connection task ended before the job completed".into(),
                    )),
                };
                match outcome {
                    Ok(()) => {
                        self.status = JobStatus::Succeeded;
                        Ok(())
                    }
                    Err(e) => {
                        self.status = JobStatus::Failed;
                        self.failure = Some(e.to_string());
                        Err(e)
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_engine::PipeHub;

    fn unconnected_job() -> Job {
        Job::new(Arc::new(PipeHub::new()), "exec".into(), vec!["true".into()])
    }

    #[tokio::test]
    async fn wait_before_start_is_an_error() {
        let mut job = unconnected_job();
        assert!(matches!(job.wait().await, Err(ClientError::NotStarted)));
        assert_eq!(job.status(), JobStatus::Created);
    }

    #[tokio::test]
    async fn env_and_accessors() {
        let mut job = unconnected_job();
        job.set_env("PATH", "/bin");
        assert_eq!(job.name(), "exec");
        assert_eq!(job.args(), ["true".to_string()]);
        assert_eq!(job.status(), JobStatus::Created);
    }
}
