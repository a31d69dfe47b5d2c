//! The transport abstraction.
//!
//! A [`Connector`] hands out bidirectional byte streams: `connect` produces
//! an outbound endpoint, `accept` blocks for an inbound one, and `close`
//! permanently fails both. The engine and client never branch on which
//! concrete transport they hold — an in-process [`PipeHub`], a unix socket,
//! or a TCP connection to a remote broker all look the same.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;

/// A bidirectional byte stream between a caller and an engine.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Conn for T {}

/// An owned, type-erased connection.
pub type BoxedConn = Box<dyn Conn>;

/// Abstract bidirectional connection factory.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Produce a new outbound endpoint. May be called concurrently and
    /// repeatedly; each call yields an independent connection.
    async fn connect(&self) -> Result<BoxedConn, EngineError>;

    /// Block until a peer connects and return the inbound endpoint.
    async fn accept(&self) -> Result<BoxedConn, EngineError>;

    /// Idempotent; afterwards all pending and future `accept`/`connect`
    /// calls fail with [`EngineError::ConnectorClosed`].
    async fn close(&self) -> Result<(), EngineError>;
}

/// Buffer capacity of each in-memory duplex pipe.
const PIPE_BUFFER: usize = 64 * 1024;

struct Handoff {
    conn: DuplexStream,
    ready: oneshot::Sender<()>,
}

/// In-process [`Connector`] implemented as a rendezvous point.
///
/// `connect` creates a fresh in-memory duplex pipe and hands one end to a
/// pending `accept` caller; it returns only once the acceptor has taken the
/// handoff, so neither side observes a connection the other does not have.
/// There is no buffering of un-accepted connections.
pub struct PipeHub {
    tx: mpsc::Sender<Handoff>,
    rx: Mutex<mpsc::Receiver<Handoff>>,
    closed: CancellationToken,
}

impl PipeHub {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx,
            rx: Mutex::new(rx),
            closed: CancellationToken::new(),
        }
    }
}

impl Default for PipeHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for PipeHub {
    async fn connect(&self) -> Result<BoxedConn, EngineError> {
        if self.closed.is_cancelled() {
            return Err(EngineError::ConnectorClosed);
        }
        let (near, far) = tokio::io::duplex(PIPE_BUFFER);
        let (ready_tx, ready_rx) = oneshot::channel();
        let handoff = Handoff {
            conn: far,
            ready: ready_tx,
        };
        tokio::select! {
            res = self.tx.send(handoff) => {
                if res.is_err() {
                    return Err(EngineError::ConnectorClosed);
                }
            }
            _ = self.closed.cancelled() => return Err(EngineError::ConnectorClosed),
        }
        tokio::select! {
            res = ready_rx => match res {
                Ok(()) => Ok(Box::new(near) as BoxedConn),
                Err(_) => Err(EngineError::ConnectorClosed),
            },
            _ = self.closed.cancelled() => Err(EngineError::ConnectorClosed),
        }
    }

    async fn accept(&self) -> Result<BoxedConn, EngineError> {
        let mut rx = tokio::select! {
            guard = self.rx.lock() => guard,
            _ = self.closed.cancelled() => return Err(EngineError::ConnectorClosed),
        };
        tokio::select! {
            handoff = rx.recv() => match handoff {
                Some(handoff) => {
                    // Unblock the connecting side.
                    let _ = handoff.ready.send(());
                    Ok(Box::new(handoff.conn) as BoxedConn)
                }
                None => Err(EngineError::ConnectorClosed),
            },
            _ = self.closed.cancelled() => Err(EngineError::ConnectorClosed),
        }
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.closed.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    #[tokio::test]
    async fn connect_blocks_until_accept() {
        let hub = PipeHub::new();
        let blocked = timeout(Duration::from_millis(50), hub.connect()).await;
        assert!(blocked.is_err(), "connect should block with no acceptor");
    }

    #[tokio::test]
    async fn accept_blocks_until_connect() {
        let hub = PipeHub::new();
        let blocked = timeout(Duration::from_millis(50), hub.accept()).await;
        assert!(blocked.is_err(), "accept should block with no connector");
    }

    #[tokio::test]
    async fn rendezvous_pairs_both_sides() {
        let hub = PipeHub::new();
        let (accepted, connected) = tokio::join!(hub.accept(), hub.connect());
        let mut server = accepted.unwrap();
        let mut client = connected.unwrap();

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn close_fails_blocked_accept() {
        let hub = Arc::new(PipeHub::new());
        let pending = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.accept().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        hub.close().await.unwrap();
        hub.close().await.unwrap(); // idempotent

        assert!(matches!(
            pending.await.unwrap(),
            Err(EngineError::ConnectorClosed)
        ));
        assert!(matches!(
            hub.accept().await,
            Err(EngineError::ConnectorClosed)
        ));
    }

    #[tokio::test]
    async fn close_fails_blocked_connect() {
        let hub = Arc::new(PipeHub::new());
        let pending = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.connect().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        hub.close().await.unwrap();

        assert!(matches!(
            pending.await.unwrap(),
            Err(EngineError::ConnectorClosed)
        ));
        assert!(matches!(
            hub.connect().await,
            Err(EngineError::ConnectorClosed)
        ));
    }
}
