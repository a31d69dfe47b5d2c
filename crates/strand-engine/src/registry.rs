//! The job-name → handler registry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::db::Db;
use crate::streams::Streams;

/// Environment mapping of one job invocation.
pub type Env = HashMap<String, String>;

/// A job handler.
///
/// Handlers are opaque capabilities: they read their declared input streams,
/// write their declared output streams, and return an error to signal
/// failure (the message text surfaces to the caller). They must not assume
/// anything about the transport, and should treat closure of an input
/// stream as the cancellation signal.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(
        &self,
        name: &str,
        args: &[String],
        env: &Env,
        streams: Streams,
        db: Arc<dyn Db>,
    ) -> anyhow::Result<()>;
}

/// Adapter turning a plain async function into a [`JobHandler`].
pub struct HandlerFn<F>(pub F);

#[async_trait]
impl<F, Fut> JobHandler for HandlerFn<F>
where
    F: Fn(String, Vec<String>, Env, Streams, Arc<dyn Db>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn run(
        &self,
        name: &str,
        args: &[String],
        env: &Env,
        streams: Streams,
        db: Arc<dyn Db>,
    ) -> anyhow::Result<()> {
        (self.0)(name.to_string(), args.to_vec(), env.clone(), streams, db).await
    }
}

/// Mapping from job name to handler. Registration happens before serving
/// begins; the registry is read-only during dispatch.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to `handler`. Last write wins: re-registering a name
    /// replaces the prior binding, which is how real implementations
    /// override the pre-registered stubs.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}
