//! The engine: job registry, dispatcher, and serving loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::connector::{BoxedConn, Connector};
use crate::db::{Db, MemoryDb};
use crate::error::EngineError;
use crate::jobs;
use crate::registry::{Env, HandlerRegistry, JobHandler};
use crate::socket::SocketConnector;
use crate::streams::Streams;
use crate::wire::{self, Frame};

/// Cross-cutting observer of job dispatch, e.g. an audit journal.
/// Hooks wrap dispatch by composition; they cannot alter its outcome.
pub trait JobHook: Send + Sync {
    fn job_started(&self, name: &str, args: &[String]);
    fn job_finished(&self, name: &str, result: &Result<(), EngineError>);
}

/// Owns the job registry and serves incoming connections.
///
/// Register handlers and hooks before serving begins; the registry is
/// read-only during dispatch.
pub struct Engine {
    root: PathBuf,
    registry: HandlerRegistry,
    db: Arc<dyn Db>,
    hooks: Vec<Arc<dyn JobHook>>,
}

impl Engine {
    /// Engine rooted at `root` with the default job set registered.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let mut registry = HandlerRegistry::new();
        jobs::register_defaults(&mut registry);
        Self {
            root: root.into(),
            registry,
            db: Arc::new(MemoryDb::new()),
            hooks: Vec::new(),
        }
    }

    /// Replace the side-channel passed to handlers.
    pub fn with_db(mut self, db: Arc<dyn Db>) -> Self {
        self.db = db;
        self
    }

    /// Bind `name` to `handler`; last write wins.
    pub fn register_job(&mut self, name: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.registry.register(name, handler);
    }

    /// Add a dispatch hook.
    pub fn add_hook(&mut self, hook: Arc<dyn JobHook>) {
        self.hooks.push(hook);
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The side-channel handed to every job this engine serves.
    pub fn db(&self) -> Arc<dyn Db> {
        self.db.clone()
    }

    /// Path of the unix socket the engine listens on for new connections.
    pub fn sock_path(&self) -> PathBuf {
        self.root.join(".engine.sock")
    }

    /// Look up `name` and invoke its handler, running the registered hooks
    /// around the call. Handler errors are returned verbatim.
    pub async fn serve_job(
        &self,
        name: &str,
        args: &[String],
        env: &Env,
        streams: Streams,
        db: Arc<dyn Db>,
    ) -> Result<(), EngineError> {
        for hook in &self.hooks {
            hook.job_started(name, args);
        }
        let result = match self.registry.get(name) {
            None => Err(EngineError::UnknownJob(name.to_string())),
            Some(handler) => handler
                .run(name, args, env, streams, db)
                .await
                .map_err(EngineError::Job),
        };
        for hook in &self.hooks {
            hook.job_finished(name, &result);
        }
        result
    }

    /// Accept connections until `shutdown` fires or the connector fails.
    /// A deliberate shutdown is a clean return, not an error.
    pub async fn serve(
        self: Arc<Self>,
        connector: Arc<dyn Connector>,
        shutdown: CancellationToken,
    ) -> Result<(), EngineError> {
        loop {
            let conn = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("shutdown requested, closing listener");
                    let _ = connector.close().await;
                    return Ok(());
                }
                res = connector.accept() => match res {
                    Ok(conn) => conn,
                    Err(_) if shutdown.is_cancelled() => return Ok(()),
                    Err(e) => return Err(e),
                },
            };
            let engine = self.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.serve_conn(conn).await {
                    tracing::warn!("connection ended with error: {e}");
                }
            });
        }
    }

    /// Serve one connection: decode the job request, dispatch it with its
    /// stream set, and report the terminal status once every outbound
    /// stream has drained.
    pub async fn serve_conn(&self, conn: BoxedConn) -> Result<(), EngineError> {
        let (mut writer, mut reader) = wire::split(conn);

        let Some(first) = reader.recv().await? else {
            // Peer connected and went away without asking for anything.
            return Ok(());
        };
        let Frame::Start {
            name,
            args,
            env,
            feeds,
        } = first
        else {
            return Err(EngineError::Protocol(
                "expected a job request as the first frame".into(),
            ));
        };
        tracing::debug!(job = %name, "serving job request");

        let (frame_tx, mut frame_rx) = mpsc::channel::<Frame>(32);
        let writer_task = tokio::spawn(async move {
            // Exit is terminal by protocol; the writer finishes once it has
            // flushed it, without waiting for every sender to drop.
            while let Some(frame) = frame_rx.recv().await {
                let is_exit = matches!(frame, Frame::Exit { .. });
                if writer.send(&frame).await.is_err() || is_exit {
                    break;
                }
            }
        });

        let streams = Streams::with_feeds(frame_tx.clone(), feeds);

        // Route caller-fed stream bytes while the handler runs. When the
        // peer disappears, closing all inbound streams is the cancellation
        // signal handlers observe.
        let demux_streams = streams.clone();
        let demux_task = tokio::spawn(async move {
            loop {
                match reader.recv().await {
                    Ok(Some(Frame::Data { stream, data })) => {
                        demux_streams.feed(&stream, data).await
                    }
                    Ok(Some(Frame::Close { stream })) => demux_streams.close_inbound(&stream),
                    Ok(Some(_)) | Ok(None) | Err(_) => break,
                }
            }
            demux_streams.close_all_inbound();
        });

        let result = self
            .serve_job(&name, &args, &env, streams.clone(), self.db.clone())
            .await;
        if let Err(e) = &result {
            tracing::debug!(job = %name, "job failed: {e}");
        }

        // Trailing output first, terminal status second.
        streams.finish_outbound().await;
        let error = result.err().map(|e| e.to_string());
        let _ = frame_tx.send(Frame::Exit { error }).await;
        drop(frame_tx);
        let _ = writer_task.await;
        demux_task.abort();
        Ok(())
    }

    /// Listen on the engine socket and serve until `shutdown` fires.
    pub async fn listen_and_serve(
        self: Arc<Self>,
        shutdown: CancellationToken,
    ) -> Result<(), EngineError> {
        let connector = Arc::new(SocketConnector::listen(self.sock_path()).await?);
        tracing::info!(socket = %self.sock_path().display(), "engine listening");
        self.serve(connector, shutdown).await
    }

    /// Remove the engine socket.
    pub fn cleanup(&self) {
        tracing::debug!("cleaning up engine");
        let _ = std::fs::remove_file(self.sock_path());
    }
}
