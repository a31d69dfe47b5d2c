//! Socket-backed connectors: unix domain sockets for local job submission
//! and TCP for the remote broker.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::connector::{BoxedConn, Connector};
use crate::error::EngineError;

/// Bind a unix listener, recovering from a stale socket file.
///
/// If the bind fails, a trial dial decides what the failure means: a
/// successful dial means another live instance owns the path and the
/// original bind error is returned untouched; a failed dial means the file
/// is a leftover from a crashed instance, so it is removed and the bind
/// retried once.
pub async fn bind_unix(path: &Path) -> Result<UnixListener, EngineError> {
    match UnixListener::bind(path) {
        Ok(listener) => Ok(listener),
        Err(bind_err) => match UnixStream::connect(path).await {
            Ok(_live) => Err(EngineError::Io(bind_err)),
            Err(_) => {
                tracing::debug!(path = %path.display(), "removing stale socket");
                std::fs::remove_file(path)?;
                Ok(UnixListener::bind(path)?)
            }
        },
    }
}

/// [`Connector`] over a unix domain socket path.
pub struct SocketConnector {
    path: PathBuf,
    listener: Mutex<Option<UnixListener>>,
    closed: CancellationToken,
}

impl SocketConnector {
    /// Outbound-only connector dialing `path`.
    pub fn dial(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            listener: Mutex::new(None),
            closed: CancellationToken::new(),
        }
    }

    /// Bind `path` (with stale-socket recovery) and accept inbound
    /// connections on it.
    pub async fn listen(path: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let path = path.into();
        let listener = bind_unix(&path).await?;
        Ok(Self {
            path,
            listener: Mutex::new(Some(listener)),
            closed: CancellationToken::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Connector for SocketConnector {
    async fn connect(&self) -> Result<BoxedConn, EngineError> {
        if self.closed.is_cancelled() {
            return Err(EngineError::ConnectorClosed);
        }
        let stream = UnixStream::connect(&self.path).await?;
        Ok(Box::new(stream))
    }

    async fn accept(&self) -> Result<BoxedConn, EngineError> {
        let guard = tokio::select! {
            guard = self.listener.lock() => guard,
            _ = self.closed.cancelled() => return Err(EngineError::ConnectorClosed),
        };
        let Some(listener) = guard.as_ref() else {
            return Err(EngineError::NotListening);
        };
        tokio::select! {
            res = listener.accept() => {
                let (stream, _addr) = res?;
                Ok(Box::new(stream) as BoxedConn)
            }
            _ = self.closed.cancelled() => Err(EngineError::ConnectorClosed),
        }
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.closed.cancel();
        self.listener.lock().await.take();
        Ok(())
    }
}

/// [`Connector`] over TCP, used to reach a shared remote job broker.
pub struct TcpConnector {
    addr: String,
    listener: Mutex<Option<TcpListener>>,
    closed: CancellationToken,
}

impl TcpConnector {
    /// Outbound-only connector dialing `addr` (host:port).
    pub fn dial(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            listener: Mutex::new(None),
            closed: CancellationToken::new(),
        }
    }

    /// Bind `addr` and accept inbound connections on it.
    pub async fn listen(addr: impl Into<String>) -> Result<Self, EngineError> {
        let addr = addr.into();
        let listener = TcpListener::bind(&addr).await?;
        Ok(Self {
            addr,
            listener: Mutex::new(Some(listener)),
            closed: CancellationToken::new(),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<BoxedConn, EngineError> {
        if self.closed.is_cancelled() {
            return Err(EngineError::ConnectorClosed);
        }
        let stream = TcpStream::connect(&self.addr).await?;
        Ok(Box::new(stream))
    }

    async fn accept(&self) -> Result<BoxedConn, EngineError> {
        let guard = tokio::select! {
            guard = self.listener.lock() => guard,
            _ = self.closed.cancelled() => return Err(EngineError::ConnectorClosed),
        };
        let Some(listener) = guard.as_ref() else {
            return Err(EngineError::NotListening);
        };
        tokio::select! {
            res = listener.accept() => {
                let (stream, _addr) = res?;
                Ok(Box::new(stream) as BoxedConn)
            }
            _ = self.closed.cancelled() => Err(EngineError::ConnectorClosed),
        }
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.closed.cancel();
        self.listener.lock().await.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn stale_socket_is_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".engine.sock");

        // A bound-then-dropped listener leaves its socket file behind,
        // exactly like a crashed instance.
        let stale = UnixListener::bind(&path).unwrap();
        drop(stale);
        assert!(path.exists());

        let connector = SocketConnector::listen(&path).await.unwrap();
        let mut client = UnixStream::connect(&path).await.unwrap();
        let mut server = connector.accept().await.unwrap();

        client.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn live_socket_is_not_stolen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".engine.sock");

        let first = SocketConnector::listen(&path).await.unwrap();
        let second = SocketConnector::listen(&path).await;
        assert!(second.is_err(), "second bind should fail");
        assert!(path.exists(), "live socket must not be deleted");

        // The first listener still works.
        let (accepted, connected) = tokio::join!(first.accept(), first.connect());
        accepted.unwrap();
        connected.unwrap();
    }

    #[tokio::test]
    async fn close_unblocks_accept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".engine.sock");
        let connector = std::sync::Arc::new(SocketConnector::listen(&path).await.unwrap());

        let pending = {
            let connector = connector.clone();
            tokio::spawn(async move { connector.accept().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        connector.close().await.unwrap();

        assert!(matches!(
            pending.await.unwrap(),
            Err(EngineError::ConnectorClosed)
        ));
    }

    #[tokio::test]
    async fn dial_only_connector_cannot_accept() {
        let dir = tempfile::tempdir().unwrap();
        let connector = SocketConnector::dial(dir.path().join("absent.sock"));
        assert!(matches!(
            connector.accept().await,
            Err(EngineError::NotListening)
        ));
    }
}
