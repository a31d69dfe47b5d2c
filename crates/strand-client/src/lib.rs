//! strand-client: the caller-side façade for submitting jobs.
//!
//! Given a [`strand_engine::Connector`], a [`Client`] constructs [`Job`]s,
//! starts them, attaches local sinks to the job's named streams, waits for
//! completion, and drains the streams:
//!
//! ```ignore
//! let client = Client::new(hub);
//! let mut job = client.new_job("exec", vec!["echo".into(), "hello".into()]);
//! job.streams().write_to(tokio::io::stdout(), "stdout")?;
//! job.streams().write_to(tokio::io::stderr(), "stderr")?;
//! job.start().await?;
//! job.wait().await?;
//! job.streams().shutdown().await?;
//! ```

mod client;
mod error;
mod job;

pub use client::Client;
pub use error::{ClientError, ClientResult};
pub use job::{Job, JobStatus};
