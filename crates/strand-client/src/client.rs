//! Caller-side façade.

use std::sync::Arc;

use strand_engine::Connector;

use crate::job::Job;

/// Submits jobs to an engine over a [`Connector`]. The same client works
/// over an in-process pipe hub, a unix socket, or a proxied broker
/// connection; nothing here branches on the concrete transport.
pub struct Client {
    connector: Arc<dyn Connector>,
}

impl Client {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }

    /// Construct a job bound to this client's connector. The job does not
    /// touch the wire until [`Job::start`].
    pub fn new_job(&self, name: impl Into<String>, args: Vec<String>) -> Job {
        Job::new(self.connector.clone(), name.into(), args)
    }
}
