//! The per-job stream multiplexer.
//!
//! A [`Streams`] instance owns the named byte channels of one job
//! invocation. Stream names are free-form strings; callers and handlers
//! agree on names ("stdin", "stdout", "stderr", ...) by convention.
//!
//! Each name is unidirectional and has exactly one owner per end:
//!
//! - **outbound** (this side produces bytes): [`Streams::open_write`] claims
//!   the writer and spawns a pump that turns pipe bytes into `Data` frames,
//!   finishing with a `Close` frame at EOF. [`Streams::read_from`] feeds an
//!   outbound stream from an external source.
//! - **inbound** (the peer produces bytes): the connection demultiplexer
//!   routes `Data` frames in via [`Streams::feed`]; [`Streams::open_read`]
//!   claims the reader and [`Streams::write_to`] drains it into an external
//!   sink until the stream closes.
//!
//! Every stream is a bounded pipe, so a slow drain stalls the producer
//! rather than buffering without bound. [`Streams::shutdown`] closes all
//! inbound streams and waits for every attached pump and drain to finish —
//! it must not return while a drain is still in flight, or the caller could
//! discard bytes a writer already produced.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{EngineError, StreamDirection};
use crate::pipe::{byte_pipe, PipeReader, PipeWriter, PIPE_CAPACITY};
use crate::wire::{Frame, DATA_CHUNK};

/// The named stream set of one job invocation. Cheap to clone; all clones
/// share the same stream table.
#[derive(Clone)]
pub struct Streams {
    inner: Arc<Inner>,
}

struct Inner {
    frames: mpsc::Sender<Frame>,
    /// Stream names the peer announced it will feed. `None` means any
    /// inbound name may be fed (the caller side, where the set of streams a
    /// job produces is unknown up front).
    feeds: Option<HashSet<String>>,
    table: Mutex<Table>,
}

#[derive(Default)]
struct Table {
    inbound: HashMap<String, InboundEntry>,
    outbound: HashSet<String>,
    /// Outbound names in claim order, announced in the job request.
    announced: Vec<String>,
    /// Pumps copying outbound pipes onto the wire.
    pumps: Vec<JoinHandle<()>>,
    /// Drains and feeders attached to external sinks and sources.
    drains: Vec<JoinHandle<()>>,
}

struct InboundEntry {
    writer: Option<Arc<PipeWriter>>,
    reader: Option<PipeReader>,
}

impl Streams {
    /// Stream set for the caller side: any inbound name may be fed.
    pub fn new(frames: mpsc::Sender<Frame>) -> Self {
        Self {
            inner: Arc::new(Inner {
                frames,
                feeds: None,
                table: Mutex::new(Table::default()),
            }),
        }
    }

    /// Stream set for the engine side. `feeds` lists the inbound names the
    /// peer will write; reading any other name yields immediate EOF instead
    /// of blocking on input that will never arrive.
    pub fn with_feeds(frames: mpsc::Sender<Frame>, feeds: Vec<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                frames,
                feeds: Some(feeds.into_iter().collect()),
                table: Mutex::new(Table::default()),
            }),
        }
    }

    /// Claim the read end of the inbound stream `name`.
    pub fn open_read(&self, name: &str) -> Result<PipeReader, EngineError> {
        let mut table = self.lock();
        self.ensure_inbound(&mut table, name);
        let entry = table
            .inbound
            .get_mut(name)
            .ok_or_else(|| EngineError::Stream(format!("inbound entry missing for {name:?}")))?;
        entry.reader.take().ok_or_else(|| EngineError::StreamClaimed {
            name: name.to_string(),
            dir: StreamDirection::Read,
        })
    }

    /// Claim the write end of the outbound stream `name` and start its pump.
    pub fn open_write(&self, name: &str) -> Result<PipeWriter, EngineError> {
        let mut table = self.lock();
        if !table.outbound.insert(name.to_string()) {
            return Err(EngineError::StreamClaimed {
                name: name.to_string(),
                dir: StreamDirection::Write,
            });
        }
        table.announced.push(name.to_string());
        let (writer, reader) = byte_pipe(PIPE_CAPACITY);
        table
            .pumps
            .push(tokio::spawn(pump(self.inner.frames.clone(), name.to_string(), reader)));
        Ok(writer)
    }

    /// Attach an external sink draining the inbound stream `name` until it
    /// closes or the stream set shuts down.
    pub fn write_to<S>(&self, sink: S, name: &str) -> Result<(), EngineError>
    where
        S: AsyncWrite + Send + Unpin + 'static,
    {
        let mut reader = self.open_read(name)?;
        let handle = tokio::spawn(async move {
            let mut sink = sink;
            let _ = tokio::io::copy(&mut reader, &mut sink).await;
        });
        self.lock().drains.push(handle);
        Ok(())
    }

    /// Attach an external source feeding the outbound stream `name`; the
    /// stream closes when the source reaches EOF.
    ///
    /// Attach sources before the job request is sent — the request announces
    /// which streams will be fed.
    pub fn read_from<R>(&self, source: R, name: &str) -> Result<(), EngineError>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let mut writer = self.open_write(name)?;
        let handle = tokio::spawn(async move {
            let mut source = source;
            let _ = tokio::io::copy(&mut source, &mut writer).await;
            // Dropping the writer closes the stream.
        });
        self.lock().drains.push(handle);
        Ok(())
    }

    /// Outbound names claimed so far, in claim order.
    pub fn outbound_names(&self) -> Vec<String> {
        self.lock().announced.clone()
    }

    /// Route bytes from the peer into the inbound stream `name`.
    ///
    /// Connection plumbing: called by the demultiplexer for each `Data`
    /// frame. Blocks on backpressure when the local reader is slow.
    pub async fn feed(&self, name: &str, data: Vec<u8>) {
        let writer = {
            let mut table = self.lock();
            self.ensure_inbound(&mut table, name);
            table.inbound.get(name).and_then(|e| e.writer.clone())
        };
        match writer {
            Some(writer) => {
                if writer.write_all_bytes(&data).await.is_err() {
                    // Local reader is gone; drop the rest of this stream.
                    self.close_inbound(name);
                }
            }
            None => tracing::debug!(stream = %name, "discarding bytes for closed stream"),
        }
    }

    /// Close the inbound stream `name`: its reader drains and then sees EOF.
    ///
    /// Connection plumbing: called by the demultiplexer for `Close` frames.
    pub fn close_inbound(&self, name: &str) {
        let mut table = self.lock();
        self.ensure_inbound(&mut table, name);
        if let Some(entry) = table.inbound.get_mut(name) {
            entry.writer = None;
        }
    }

    /// Close every inbound stream, e.g. when the connection goes away.
    /// Handlers blocked on input observe EOF as the cancellation signal.
    pub fn close_all_inbound(&self) {
        let mut table = self.lock();
        for entry in table.inbound.values_mut() {
            entry.writer = None;
        }
    }

    /// Wait for every outbound pump to finish. The engine sends the
    /// terminal frame only after this returns, so the caller cannot observe
    /// completion before trailing output is on the wire.
    pub async fn finish_outbound(&self) {
        let pumps = std::mem::take(&mut self.lock().pumps);
        for pump in pumps {
            let _ = pump.await;
        }
    }

    /// Close all inbound streams and wait for every pump, drain, and feeder
    /// to terminate. Call after the job has reached a terminal state;
    /// shutting down earlier risks discarding trailing output.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let (pumps, drains) = {
            let mut table = self.lock();
            for entry in table.inbound.values_mut() {
                entry.writer = None;
            }
            (
                std::mem::take(&mut table.pumps),
                std::mem::take(&mut table.drains),
            )
        };
        for handle in pumps.into_iter().chain(drains) {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    return Err(EngineError::Stream(format!("stream task panicked: {e}")));
                }
            }
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Table> {
        self.inner
            .table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_inbound(&self, table: &mut Table, name: &str) {
        if !table.inbound.contains_key(name) {
            let (writer, reader) = byte_pipe(PIPE_CAPACITY);
            let mut entry = InboundEntry {
                writer: Some(Arc::new(writer)),
                reader: Some(reader),
            };
            if let Some(feeds) = &self.inner.feeds {
                if !feeds.contains(name) {
                    // Never fed by the peer: readers see EOF right away.
                    entry.writer = None;
                }
            }
            table.inbound.insert(name.to_string(), entry);
        }
    }
}

/// Copy an outbound pipe onto the wire as `Data` frames, closing the
/// stream once the writer side is done.
async fn pump(frames: mpsc::Sender<Frame>, name: String, mut source: PipeReader) {
    let mut buf = [0u8; DATA_CHUNK];
    loop {
        match source.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let frame = Frame::Data {
                    stream: name.clone(),
                    data: buf[..n].to_vec(),
                };
                if frames.send(frame).await.is_err() {
                    // Connection writer is gone; nothing left to close.
                    return;
                }
            }
        }
    }
    let _ = frames.send(Frame::Close { stream: name }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn make_streams() -> (Streams, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(32);
        (Streams::new(tx), rx)
    }

    #[tokio::test]
    async fn double_claim_is_an_error() {
        let (streams, _rx) = make_streams();

        streams.open_write("out").unwrap();
        assert!(matches!(
            streams.open_write("out"),
            Err(EngineError::StreamClaimed { .. })
        ));

        streams.open_read("in").unwrap();
        assert!(matches!(
            streams.open_read("in"),
            Err(EngineError::StreamClaimed { .. })
        ));

        // Same name, opposite directions: two independent streams.
        streams.open_read("out").unwrap();
        streams.open_write("in").unwrap();
    }

    #[tokio::test]
    async fn pump_emits_data_then_close() {
        let (streams, mut rx) = make_streams();

        let mut writer = streams.open_write("stdout").unwrap();
        writer.write_all(b"hello").await.unwrap();
        drop(writer);

        assert_eq!(
            rx.recv().await.unwrap(),
            Frame::Data {
                stream: "stdout".into(),
                data: b"hello".to_vec(),
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            Frame::Close {
                stream: "stdout".into(),
            }
        );
    }

    #[tokio::test]
    async fn drain_sees_fed_bytes_before_shutdown_returns() {
        let (streams, _rx) = make_streams();

        let (sink, mut capture) = tokio::io::duplex(4096);
        streams.write_to(sink, "stdout").unwrap();

        streams.feed("stdout", b"line 1\n".to_vec()).await;
        streams.feed("stdout", b"line 2\n".to_vec()).await;
        streams.close_inbound("stdout");
        streams.shutdown().await.unwrap();

        let mut out = Vec::new();
        capture.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"line 1\nline 2\n");
    }

    #[tokio::test]
    async fn unfed_stream_reads_eof_immediately() {
        let (tx, _rx) = mpsc::channel(32);
        let streams = Streams::with_feeds(tx, vec!["stdin".into()]);

        // "other" was not announced: immediate EOF.
        let mut reader = streams.open_read("other").unwrap();
        let mut buf = Vec::new();
        let n = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            reader.read_to_end(&mut buf),
        )
        .await
        .expect("unfed stream should not block")
        .unwrap();
        assert_eq!(n, 0);

        // "stdin" was announced: it blocks until fed.
        let mut stdin = streams.open_read("stdin").unwrap();
        streams.feed("stdin", b"input".to_vec()).await;
        streams.close_inbound("stdin");
        let mut buf = Vec::new();
        stdin.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"input");
    }

    #[tokio::test]
    async fn read_from_feeds_and_closes_outbound() {
        let (streams, mut rx) = make_streams();

        let (mut source_in, source_out) = tokio::io::duplex(4096);
        streams.read_from(source_out, "stdin").unwrap();
        assert_eq!(streams.outbound_names(), vec!["stdin".to_string()]);

        source_in.write_all(b"typed").await.unwrap();
        drop(source_in);

        assert_eq!(
            rx.recv().await.unwrap(),
            Frame::Data {
                stream: "stdin".into(),
                data: b"typed".to_vec(),
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            Frame::Close {
                stream: "stdin".into(),
            }
        );
        streams.shutdown().await.unwrap();
    }
}
