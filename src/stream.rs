// ABOUTME: Per-stream state and the public MuxStream handle
// ABOUTME: Read/write blocking uses raw Wakers, following the yamux-style Shared/Stream split

use crate::error::{Error, Result};
use crate::session::Inner;
use bytes::{Buf, Bytes};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Mutable per-stream state, guarded by a single mutex. Modeled on the `Shared` struct a
/// typical connection-multiplexing crate keeps per logical stream: a receive queue, flow
/// control counters, half-close flags, and the wakers for whichever task is blocked on this
/// stream's read or write side.
#[derive(Default)]
struct StreamState {
    recv_queue: VecDeque<Bytes>,
    peer_finished: bool,
    /// Cumulative bytes the peer has told us it consumed.
    peer_consumed: u32,
    /// Current free window the peer has advertised.
    peer_window: u32,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

/// Shared stream state reachable from both the `MuxStream` handle and the session's receiver
/// task. Lives behind an `Arc` in the stream table.
#[derive(Debug)]
pub struct StreamShared {
    pub id: u32,
    state: Mutex<StreamState>,
    /// Total payload bytes locally written via `PSH`, for computing the open peer window.
    num_written: AtomicU32,
    /// Total payload bytes handed to the local consumer, reported to the peer via `UPD`.
    num_read: AtomicU32,
    local_closed: AtomicBool,
    session_closed: AtomicBool,
}

impl std::fmt::Debug for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamState")
            .field("queued_chunks", &self.recv_queue.len())
            .field("peer_finished", &self.peer_finished)
            .field("peer_consumed", &self.peer_consumed)
            .field("peer_window", &self.peer_window)
            .finish()
    }
}

impl StreamShared {
    pub fn new(id: u32, initial_peer_window: u32) -> Arc<Self> {
        Arc::new(StreamShared {
            id,
            state: Mutex::new(StreamState {
                peer_window: initial_peer_window,
                ..Default::default()
            }),
            num_written: AtomicU32::new(0),
            num_read: AtomicU32::new(0),
            local_closed: AtomicBool::new(false),
            session_closed: AtomicBool::new(false),
        })
    }

    /// Called by the receiver under the stream-table lock on `PSH` ingest. Must not block on
    /// user code.
    pub fn push_bytes(&self, data: Bytes) {
        let mut state = self.state.lock().unwrap();
        state.recv_queue.push_back(data);
        let waker = state.read_waker.take();
        drop(state);
        if let Some(w) = waker {
            w.wake();
        }
    }

    /// Called by the receiver on `FIN` ingest.
    pub fn mark_fin(&self) {
        let mut state = self.state.lock().unwrap();
        state.peer_finished = true;
        let waker = state.read_waker.take();
        drop(state);
        if let Some(w) = waker {
            w.wake();
        }
    }

    /// Called by the receiver on `UPD` ingest. Returns an error if the peer claims to have
    /// consumed more than we have actually sent.
    pub fn update(&self, consumed: u32, window: u32) -> Result<()> {
        let sent = self.num_written.load(Ordering::Acquire);
        if consumed > sent {
            return Err(Error::Consumed { consumed, sent });
        }
        let mut state = self.state.lock().unwrap();
        state.peer_consumed = consumed;
        state.peer_window = window;
        let waker = state.write_waker.take();
        drop(state);
        if let Some(w) = waker {
            w.wake();
        }
        Ok(())
    }

    /// Marks this stream as belonging to a now-dead session and wakes both waiters.
    pub fn mark_session_closed(&self) {
        self.session_closed.store(true, Ordering::Release);
        let mut state = self.state.lock().unwrap();
        let read_waker = state.read_waker.take();
        let write_waker = state.write_waker.take();
        drop(state);
        if let Some(w) = read_waker {
            w.wake();
        }
        if let Some(w) = write_waker {
            w.wake();
        }
    }

    /// Drains the receive queue and returns the number of bytes it held, for crediting back
    /// to the token bucket on stream teardown.
    pub fn recycle_tokens(&self) -> u32 {
        let mut state = self.state.lock().unwrap();
        let total: usize = state.recv_queue.iter().map(Bytes::len).sum();
        state.recv_queue.clear();
        total as u32
    }

    fn open_peer_window(&self) -> u32 {
        let state = self.state.lock().unwrap();
        let consumed_gap = self
            .num_written
            .load(Ordering::Acquire)
            .saturating_sub(state.peer_consumed);
        state.peer_window.saturating_sub(consumed_gap)
    }
}

type BoxedWriteFut = Pin<Box<dyn Future<Output = Result<u32>> + Send>>;
type BoxedShutdownFut = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// A single logical, ordered, flow-controlled byte stream multiplexed over a session.
///
/// Implements `AsyncRead`/`AsyncWrite`; reads drain the receive queue and return buffered
/// bytes to the session's admission bucket, writes submit `PSH` frames through the shaper.
pub struct MuxStream {
    shared: Arc<StreamShared>,
    session: Arc<Inner>,
    pending_write: Option<BoxedWriteFut>,
    pending_shutdown: Option<BoxedShutdownFut>,
}

impl std::fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxStream").field("id", &self.shared.id).finish()
    }
}

impl MuxStream {
    pub(crate) fn new(shared: Arc<StreamShared>, session: Arc<Inner>) -> Self {
        MuxStream {
            shared,
            session,
            pending_write: None,
            pending_shutdown: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.shared.id
    }

    fn is_dead(&self) -> bool {
        self.shared.session_closed.load(Ordering::Acquire) || self.session.is_closed()
    }
}

fn io_err(e: Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
}

fn broken_pipe() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stream's session is closed")
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.is_dead() {
            return Poll::Ready(Ok(()));
        }

        let mut state = this.shared.state.lock().unwrap();
        if let Some(front) = state.recv_queue.front_mut() {
            let n = front.len().min(buf.remaining());
            buf.put_slice(&front[..n]);
            front.advance(n);
            if front.is_empty() {
                state.recv_queue.pop_front();
            }
            drop(state);
            this.session.return_tokens(n as u32);

            // Report the new cumulative consumed count and our (session-wide) receive
            // window back to the peer so its write path can keep advancing. Submitted as a
            // detached task since `poll_read` cannot await the shaper directly.
            let total_read = this.shared.num_read.fetch_add(n as u32, Ordering::AcqRel) + n as u32;
            let window = this.session.config.max_receive_buffer;
            let session = this.session.clone();
            let id = this.shared.id;
            tokio::spawn(async move {
                let _ = session.submit_update(id, total_read, window).await;
            });

            return Poll::Ready(Ok(()));
        }

        if state.peer_finished {
            return Poll::Ready(Ok(()));
        }

        state.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();

        if let Some(fut) = this.pending_write.as_mut() {
            return match fut.as_mut().poll(cx) {
                Poll::Ready(Ok(written)) => {
                    this.pending_write = None;
                    this.shared.num_written.fetch_add(written, Ordering::AcqRel);
                    Poll::Ready(Ok(written as usize))
                }
                Poll::Ready(Err(e)) => {
                    this.pending_write = None;
                    Poll::Ready(Err(io_err(e)))
                }
                Poll::Pending => Poll::Pending,
            };
        }

        if this.is_dead() {
            return Poll::Ready(Err(broken_pipe()));
        }

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let window = this.shared.open_peer_window();
        if window == 0 {
            let mut state = this.shared.state.lock().unwrap();
            state.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let max_frame = this.session.config.max_frame_size as usize;
        let n = buf.len().min(window as usize).min(max_frame).max(1).min(buf.len());
        let payload = Bytes::copy_from_slice(&buf[..n]);
        let session = this.session.clone();
        let id = this.shared.id;
        let mut fut: BoxedWriteFut = Box::pin(async move { session.submit_push(id, payload).await });

        match fut.as_mut().poll(cx) {
            Poll::Ready(Ok(written)) => {
                this.shared.num_written.fetch_add(written, Ordering::AcqRel);
                Poll::Ready(Ok(written as usize))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(io_err(e))),
            Poll::Pending => {
                this.pending_write = Some(fut);
                Poll::Pending
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();

        if let Some(fut) = this.pending_shutdown.as_mut() {
            return match fut.as_mut().poll(cx) {
                Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
                Poll::Ready(Err(e)) => Poll::Ready(Err(io_err(e))),
                Poll::Pending => Poll::Pending,
            };
        }

        if this.shared.local_closed.swap(true, Ordering::AcqRel) {
            return Poll::Ready(Ok(()));
        }

        let session = this.session.clone();
        let id = this.shared.id;
        let mut fut: BoxedShutdownFut = Box::pin(async move { session.submit_fin(id).await });
        match fut.as_mut().poll(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(io_err(e))),
            Poll::Pending => {
                this.pending_shutdown = Some(fut);
                Poll::Pending
            }
        }
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        let recycled = self.shared.recycle_tokens();
        self.session.return_tokens(recycled);
        self.session.forget_stream(self.shared.id);
    }
}
