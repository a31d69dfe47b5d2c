//! Bounded byte pipe with backpressure.
//!
//! Each named job stream is backed by one of these pipes. The writer blocks
//! when the buffer is full — matching OS pipe semantics with ~64KB kernel
//! buffers — so a slow drain stalls the producer instead of buffering
//! without bound.
//!
//! ```text
//!   PipeWriter ──▶ [VecDeque<u8> ring buffer] ──▶ PipeReader
//!                  ├── writer blocks when full (backpressure)
//!                  ├── reader blocks when empty
//!                  ├── close/drop writer → EOF (reader returns 0)
//!                  └── drop reader → broken pipe (writer returns error)
//! ```
//!
//! All shared state, including the closed flags, lives behind a single
//! `std::sync::Mutex`; critical sections are just VecDeque operations and
//! waker registration, so the lock is never held across a suspension point
//! and Drop stays synchronous. Wakers are stored under the lock to prevent
//! lost wakeups.

use std::collections::VecDeque;
use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll, Waker};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Default pipe capacity (matches the Linux kernel pipe default).
pub const PIPE_CAPACITY: usize = 64 * 1024;

struct State {
    buf: VecDeque<u8>,
    capacity: usize,
    /// Writer end closed or dropped; reader drains the buffer then sees EOF.
    write_closed: bool,
    /// Reader end dropped; writes fail with `BrokenPipe`.
    read_closed: bool,
    /// Waker for a reader waiting on an empty buffer.
    read_waker: Option<Waker>,
    /// Waker for a writer waiting on a full buffer.
    write_waker: Option<Waker>,
}

struct Shared {
    state: Mutex<State>,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Writing end of a byte pipe.
pub struct PipeWriter {
    shared: Arc<Shared>,
}

/// Reading end of a byte pipe.
pub struct PipeReader {
    shared: Arc<Shared>,
}

/// Create a pipe pair with the given buffer capacity.
pub fn byte_pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            buf: VecDeque::with_capacity(capacity.min(8192)),
            capacity,
            write_closed: false,
            read_closed: false,
            read_waker: None,
            write_waker: None,
        }),
    });
    (
        PipeWriter {
            shared: shared.clone(),
        },
        PipeReader { shared },
    )
}

impl PipeWriter {
    /// Write as much of `data` as fits, blocking while the buffer is full.
    ///
    /// Returns the number of bytes written, or `BrokenPipe` once the reader
    /// is gone.
    pub async fn write_bytes(&self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        poll_fn(|cx| self.poll_write_impl(cx, data)).await
    }

    /// Write all of `data`, blocking on backpressure as needed.
    pub async fn write_all_bytes(&self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            let n = self.write_bytes(data).await?;
            data = &data[n..];
        }
        Ok(())
    }

    /// Close the writing end; the reader drains the buffer and then sees EOF.
    pub fn close(&self) {
        let mut state = self.shared.lock();
        state.write_closed = true;
        if let Some(waker) = state.read_waker.take() {
            waker.wake();
        }
    }

    fn poll_write_impl(&self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let mut state = self.shared.lock();
        if state.read_closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "pipe reader closed",
            )));
        }
        if state.write_closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "pipe writer closed",
            )));
        }
        let available = state.capacity.saturating_sub(state.buf.len());
        if available == 0 {
            state.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        let n = buf.len().min(available);
        state.buf.extend(&buf[..n]);
        if let Some(waker) = state.read_waker.take() {
            waker.wake();
        }
        Poll::Ready(Ok(n))
    }
}

impl AsyncWrite for PipeWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.poll_write_impl(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.close();
        Poll::Ready(Ok(()))
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.close();
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut state = self.shared.lock();
        if !state.buf.is_empty() {
            let n = buf.remaining().min(state.buf.len());
            let (front, back) = state.buf.as_slices();
            if n <= front.len() {
                buf.put_slice(&front[..n]);
            } else {
                buf.put_slice(front);
                buf.put_slice(&back[..n - front.len()]);
            }
            state.buf.drain(..n);
            if let Some(waker) = state.write_waker.take() {
                waker.wake();
            }
            Poll::Ready(Ok(()))
        } else if state.write_closed {
            // EOF: writer is gone and the buffer is drained
            Poll::Ready(Ok(()))
        } else {
            state.read_waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.read_closed = true;
        if let Some(waker) = state.write_waker.take() {
            waker.wake();
        }
    }
}

impl std::fmt::Debug for PipeWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeWriter").finish()
    }
}

impl std::fmt::Debug for PipeReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeReader").finish()
    }
}
