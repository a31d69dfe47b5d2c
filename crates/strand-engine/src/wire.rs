//! Wire protocol for one job invocation.
//!
//! A connection carries exactly one job. The caller opens with a [`Frame::Start`]
//! naming the job, its arguments, environment, and the streams it intends to
//! feed. Both sides then exchange [`Frame::Data`] and [`Frame::Close`] frames
//! for the job's named byte streams, and the engine finishes with a single
//! [`Frame::Exit`] once every outbound stream has drained.
//!
//! Frames are serialized with postcard and framed with a 4-byte length
//! prefix, so the protocol runs unchanged over any reliable byte transport —
//! an in-memory duplex pipe, a unix socket, or a proxied TCP connection.

use std::collections::HashMap;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::connector::BoxedConn;
use crate::error::EngineError;

/// Upper bound on a single frame, start frames and data chunks included.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Preferred payload size for a single `Data` frame.
pub const DATA_CHUNK: usize = 16 * 1024;

/// One protocol unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Job request; must be the first frame on a connection.
    ///
    /// `feeds` lists the stream names the caller will write. A handler
    /// reading any other name sees immediate EOF instead of blocking.
    Start {
        name: String,
        args: Vec<String>,
        env: HashMap<String, String>,
        feeds: Vec<String>,
    },
    /// Bytes for a named stream.
    Data { stream: String, data: Vec<u8> },
    /// The writer side of a named stream is done.
    Close { stream: String },
    /// Terminal job status; an error message if the job failed.
    Exit { error: Option<String> },
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// Split a connection into framed halves.
pub fn split(conn: BoxedConn) -> (FrameWriter, FrameReader) {
    let (read, write) = tokio::io::split(conn);
    (
        FrameWriter {
            inner: FramedWrite::new(write, codec()),
        },
        FrameReader {
            inner: FramedRead::new(read, codec()),
        },
    )
}

/// Sending half of a framed connection.
pub struct FrameWriter {
    inner: FramedWrite<WriteHalf<BoxedConn>, LengthDelimitedCodec>,
}

impl FrameWriter {
    /// Encode and send one frame, flushing it to the transport.
    pub async fn send(&mut self, frame: &Frame) -> Result<(), EngineError> {
        let payload = postcard::to_allocvec(frame)?;
        self.inner.send(Bytes::from(payload)).await?;
        Ok(())
    }
}

/// Receiving half of a framed connection.
pub struct FrameReader {
    inner: FramedRead<ReadHalf<BoxedConn>, LengthDelimitedCodec>,
}

impl FrameReader {
    /// Receive the next frame; `None` once the peer closes the connection.
    pub async fn recv(&mut self) -> Result<Option<Frame>, EngineError> {
        match self.inner.next().await {
            None => Ok(None),
            Some(Ok(payload)) => Ok(Some(postcard::from_bytes(&payload)?)),
            Some(Err(e)) => Err(EngineError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (FrameWriter, FrameReader, FrameWriter, FrameReader) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (aw, ar) = split(Box::new(a));
        let (bw, br) = split(Box::new(b));
        (aw, ar, bw, br)
    }

    #[tokio::test]
    async fn frames_round_trip() {
        let (mut aw, _ar, _bw, mut br) = pair();

        let start = Frame::Start {
            name: "exec".into(),
            args: vec!["echo".into(), "hello".into()],
            env: HashMap::from([("KEY".into(), "value".into())]),
            feeds: vec!["stdin".into()],
        };
        aw.send(&start).await.unwrap();
        aw.send(&Frame::Data {
            stream: "stdin".into(),
            data: b"abc".to_vec(),
        })
        .await
        .unwrap();
        aw.send(&Frame::Close {
            stream: "stdin".into(),
        })
        .await
        .unwrap();

        assert_eq!(br.recv().await.unwrap(), Some(start));
        assert_eq!(
            br.recv().await.unwrap(),
            Some(Frame::Data {
                stream: "stdin".into(),
                data: b"abc".to_vec(),
            })
        );
        assert_eq!(
            br.recv().await.unwrap(),
            Some(Frame::Close {
                stream: "stdin".into(),
            })
        );
    }

    #[tokio::test]
    async fn recv_returns_none_on_peer_close() {
        let (aw, ar, _bw, mut br) = pair();
        // Both halves must go away for the connection to close.
        drop(aw);
        drop(ar);
        assert_eq!(br.recv().await.unwrap(), None);
    }
}
