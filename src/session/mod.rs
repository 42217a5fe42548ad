// ABOUTME: Session facade: configuration, shared inner state, and the public operations
// ABOUTME: that open/accept streams and observe/trigger session termination

mod keepalive;
mod receiver;
mod sender;

use crate::codec::{Command, FrameHeader};
use crate::connection::{FrameReader, FrameWriter, PeerAddr, SupportsVectoredWrites};
use crate::error::{Error, Result, TerminalState};
use crate::shaper::{Shaper, WriteClass, WriteRequest};
use crate::stream::{MuxStream, StreamShared};
use crate::stream_table::StreamTable;
use crate::token_bucket::TokenBucket;
use bytes::Bytes;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Configuration for a session, mirroring the teacher's builder-setter style for its
/// keepalive configuration. All fields are required; there is no environment-variable or
/// file-based configuration surface.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Whether this side is the stream-id opener (odd ids starting at 1) or the accepter
    /// (even ids starting at 0).
    pub client: bool,
    pub version: u8,
    pub max_frame_size: u32,
    pub max_receive_buffer: u32,
    pub keepalive_disabled: bool,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
}

impl SessionConfig {
    pub fn new(client: bool) -> Self {
        SessionConfig {
            client,
            version: 1,
            max_frame_size: 16 * 1024,
            max_receive_buffer: 256 * 1024,
            keepalive_disabled: false,
            keepalive_interval: Duration::from_secs(30),
            keepalive_timeout: Duration::from_secs(90),
        }
    }

    pub fn version(mut self, v: u8) -> Self {
        self.version = v;
        self
    }

    pub fn max_frame_size(mut self, v: u32) -> Self {
        self.max_frame_size = v;
        self
    }

    pub fn max_receive_buffer(mut self, v: u32) -> Self {
        self.max_receive_buffer = v;
        self
    }

    pub fn keepalive_disabled(mut self, v: bool) -> Self {
        self.keepalive_disabled = v;
        self
    }

    pub fn keepalive_interval(mut self, v: Duration) -> Self {
        self.keepalive_interval = v;
        self
    }

    pub fn keepalive_timeout(mut self, v: Duration) -> Self {
        self.keepalive_timeout = v;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig::new(true)
    }
}

/// Deadline used for `open_stream`'s `SYN` submission, per the session API contract.
const OPEN_STREAM_DEADLINE: Duration = Duration::from_secs(30);

/// Shared state reachable from the session facade, the three background tasks, and every
/// live `MuxStream`.
pub struct Inner {
    pub config: SessionConfig,
    stream_table: StreamTable,
    bucket: TokenBucket,
    shaper: Shaper,
    sequence: AtomicU64,
    next_stream_id: AtomicU32,
    go_away: AtomicBool,
    data_ready: AtomicBool,
    terminal: OnceLock<TerminalState>,
    terminal_notify: Notify,
    accept_deadline: Mutex<Option<Instant>>,
    local_addr: Option<std::net::SocketAddr>,
    remote_addr: Option<std::net::SocketAddr>,
}

impl Inner {
    pub fn is_closed(&self) -> bool {
        self.terminal.get().is_some()
    }

    pub fn terminal_error(&self) -> Option<Error> {
        self.terminal.get().map(TerminalState::as_error)
    }

    /// Sets the terminal state if none is set yet. Returns `true` if this call won the race.
    pub fn set_terminal(&self, state: TerminalState) -> bool {
        let won = self.terminal.set(state).is_ok();
        if won {
            self.terminal_notify.notify_waiters();
        }
        won
    }

    pub async fn wait_closed(&self) {
        if self.is_closed() {
            return;
        }
        let notified = self.terminal_notify.notified();
        tokio::pin!(notified);
        if self.is_closed() {
            return;
        }
        notified.await;
    }

    /// Marks a frame as having arrived, for the keepalive task's silence check.
    pub fn mark_data_ready(&self) {
        self.data_ready.store(true, Ordering::Release);
    }

    /// Atomically clears `data_ready`, returning whether it was set. Used by the keepalive
    /// task's silence check, which must not race a concurrent receiver marking it true.
    pub(crate) fn swap_data_ready_false(&self) -> bool {
        self.data_ready.swap(false, Ordering::AcqRel)
    }

    pub fn bucket(&self) -> &TokenBucket {
        &self.bucket
    }

    pub fn stream_table(&self) -> &StreamTable {
        &self.stream_table
    }

    pub fn shaper(&self) -> &Shaper {
        &self.shaper
    }

    /// Credits bytes back to the admission bucket, called by a stream's read path after
    /// handing bytes to its consumer, and by stream teardown.
    pub fn return_tokens(&self, n: u32) {
        self.bucket.credit(n);
    }

    pub fn forget_stream(&self, id: u32) {
        self.stream_table.remove(id);
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocates the next local stream id, advancing by 2 to preserve parity. Sets `GoAway`
    /// and fails once the counter would cross back to the initial parity.
    fn allocate_stream_id(&self) -> Result<u32> {
        if self.go_away.load(Ordering::Acquire) {
            return Err(Error::GoAway);
        }
        let id = self.next_stream_id.fetch_add(2, Ordering::AcqRel);
        if id > u32::MAX - 2 {
            self.go_away.store(true, Ordering::Release);
            return Err(Error::GoAway);
        }
        Ok(id)
    }

    async fn race_closed<F: Future>(&self, fut: F, deadline: Option<Instant>) -> Result<F::Output> {
        tokio::pin!(fut);
        match deadline {
            Some(d) => {
                tokio::select! {
                    out = &mut fut => Ok(out),
                    _ = self.wait_closed() => Err(self.terminal_error().unwrap_or(Error::ClosedPipe)),
                    _ = tokio::time::sleep_until(d) => Err(Error::Timeout),
                }
            }
            None => {
                tokio::select! {
                    out = &mut fut => Ok(out),
                    _ = self.wait_closed() => Err(self.terminal_error().unwrap_or(Error::ClosedPipe)),
                }
            }
        }
    }

    /// Submits a frame through the shaper and awaits its completion, honoring an optional
    /// deadline across both the ingress (enqueue) and completion phases. A timeout during
    /// ingress aborts without enqueueing; a timeout during completion may still see the
    /// frame transmitted.
    async fn submit_frame(
        &self,
        class: WriteClass,
        header: FrameHeader,
        payload: Bytes,
        deadline: Option<Instant>,
    ) -> Result<usize> {
        if let Some(err) = self.terminal_error() {
            return Err(err);
        }

        let (tx, rx) = oneshot::channel();
        let request = WriteRequest {
            class,
            sequence: self.next_sequence(),
            header,
            payload,
            completion: tx,
        };

        self.race_closed(self.shaper.submit(request), deadline)
            .await?;

        let outcome = self.race_closed(rx, deadline).await?;
        outcome.map_err(|_| Error::ClosedPipe)?
    }

    pub(crate) async fn submit_push(&self, stream_id: u32, payload: Bytes) -> Result<u32> {
        let header = FrameHeader {
            version: self.config.version,
            command: Command::Psh,
            length: payload.len() as u16,
            stream_id,
        };
        self.submit_frame(WriteClass::Data, header, payload, None)
            .await
            .map(|n| n as u32)
    }

    pub(crate) async fn submit_fin(&self, stream_id: u32) -> Result<()> {
        let header = FrameHeader {
            version: self.config.version,
            command: Command::Fin,
            length: 0,
            stream_id,
        };
        self.submit_frame(WriteClass::Ctrl, header, Bytes::new(), None)
            .await
            .map(|_| ())
    }

    async fn submit_syn(&self, stream_id: u32, deadline: Instant) -> Result<()> {
        let header = FrameHeader {
            version: self.config.version,
            command: Command::Syn,
            length: 0,
            stream_id,
        };
        self.submit_frame(WriteClass::Ctrl, header, Bytes::new(), Some(deadline))
            .await
            .map(|_| ())
    }

    pub(crate) async fn submit_nop(&self, deadline: Instant) -> Result<()> {
        let header = FrameHeader {
            version: self.config.version,
            command: Command::Nop,
            length: 0,
            stream_id: 0,
        };
        self.submit_frame(WriteClass::Ctrl, header, Bytes::new(), Some(deadline))
            .await
            .map(|_| ())
    }

    pub(crate) async fn submit_update(&self, stream_id: u32, consumed: u32, window: u32) -> Result<()> {
        let upd = crate::codec::WindowUpdate { consumed, window };
        let payload = upd.encode();
        let header = FrameHeader {
            version: self.config.version,
            command: Command::Upd,
            length: payload.len() as u16,
            stream_id,
        };
        self.submit_frame(WriteClass::Ctrl, header, payload, None)
            .await
            .map(|_| ())
    }
}

/// A multiplexed session over a single reliable duplex transport.
///
/// Owns four long-lived tasks: a receiver, a sender (the shaper is folded into the shared
/// `Shaper` structure the sender pulls from rather than its own task), and an optional
/// keepalive task. Dropping the session does not close it; call [`Session::close`]
/// explicitly, or rely on all handles and tasks winding down once the transport errors.
pub struct Session<T> {
    inner: Arc<Inner>,
    receiver_task: JoinHandle<()>,
    sender_task: JoinHandle<()>,
    keepalive_task: Option<JoinHandle<()>>,
    _marker: std::marker::PhantomData<T>,
}

impl<T> Session<T>
where
    T: AsyncRead + AsyncWrite + PeerAddr + SupportsVectoredWrites + Unpin + Send + 'static,
{
    pub fn new(transport: T, config: SessionConfig) -> Self {
        let local_addr = transport.local_addr();
        let remote_addr = transport.remote_addr();
        let vectored = transport.supports_vectored_writes();

        let start_id: u32 = if config.client { 1 } else { 0 };
        let inner = Arc::new(Inner {
            bucket: TokenBucket::new(config.max_receive_buffer),
            stream_table: StreamTable::new(),
            shaper: Shaper::new(),
            sequence: AtomicU64::new(0),
            next_stream_id: AtomicU32::new(start_id),
            go_away: AtomicBool::new(false),
            data_ready: AtomicBool::new(false),
            terminal: OnceLock::new(),
            terminal_notify: Notify::new(),
            accept_deadline: Mutex::new(None),
            local_addr,
            remote_addr,
            config,
        });

        let (read_half, write_half) = tokio::io::split(transport);
        let reader = FrameReader::new(read_half, inner.config.version, inner.config.max_frame_size as usize);
        let writer = FrameWriter::new(write_half, inner.config.max_frame_size as usize);

        let receiver_task = tokio::spawn(receiver::run(reader, inner.clone()));
        let sender_task = tokio::spawn(sender::run(writer, inner.clone(), vectored));
        let keepalive_task = if inner.config.keepalive_disabled {
            None
        } else {
            Some(tokio::spawn(keepalive::run(inner.clone())))
        };

        Session {
            inner,
            receiver_task,
            sender_task,
            keepalive_task,
            _marker: std::marker::PhantomData,
        }
    }

    /// Opens a new local stream, submitting `SYN` with a 30-second deadline.
    pub async fn open_stream(&self) -> Result<MuxStream> {
        if let Some(err) = self.inner.terminal_error() {
            return Err(err);
        }
        let id = self.inner.allocate_stream_id()?;
        let deadline = Instant::now() + OPEN_STREAM_DEADLINE;
        self.inner.submit_syn(id, deadline).await?;

        let shared = StreamShared::new(id, self.inner.config.max_receive_buffer);
        self.inner.stream_table.insert_local(shared.clone());
        Ok(MuxStream::new(shared, self.inner.clone()))
    }

    /// Alias for [`Session::open_stream`] returning a boxed `AsyncRead + AsyncWrite`
    /// capability, for collaborators that don't need the concrete stream type.
    pub async fn open(&self) -> Result<Box<dyn AsyncReadWrite>> {
        Ok(Box::new(self.open_stream().await?))
    }

    /// Blocks on the accept backlog for a newly arrived remote stream, honoring the
    /// session deadline set via [`Session::set_deadline`].
    pub async fn accept_stream(&self) -> Result<MuxStream> {
        let deadline = *self.inner.accept_deadline.lock().unwrap();
        // A deadline already in the past must report `Timeout` outright rather than race an
        // already-queued backlog entry: `race_closed`'s select has no ordering preference
        // between its branches, so an elapsed deadline and a ready backlog would otherwise be
        // chosen between at random.
        if let Some(d) = deadline {
            if d <= Instant::now() {
                return Err(Error::Timeout);
            }
        }
        let accepted = self
            .inner
            .race_closed(self.inner.stream_table.accept(), deadline)
            .await?;
        let shared = accepted.ok_or(Error::ClosedPipe)?;
        Ok(MuxStream::new(shared, self.inner.clone()))
    }

    /// Alias for [`Session::accept_stream`].
    pub async fn accept(&self) -> Result<Box<dyn AsyncReadWrite>> {
        Ok(Box::new(self.accept_stream().await?))
    }

    /// Closes the session once. Subsequent calls return `ClosedPipe`.
    pub fn close(&self) -> Result<()> {
        if !self.inner.set_terminal(TerminalState::Closed) {
            return Err(Error::ClosedPipe);
        }
        self.inner.stream_table.mark_all_session_closed();
        Ok(())
    }

    /// Resolves once the session has reached its terminal state, for collaborators that
    /// want to observe termination without polling `is_closed`.
    pub async fn close_notified(&self) {
        self.inner.wait_closed().await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// The error stored in the terminal state, once the session has closed. `None` while
    /// the session is still live.
    pub fn terminal_error(&self) -> Option<Error> {
        self.inner.terminal_error()
    }

    pub fn num_streams(&self) -> usize {
        if self.inner.is_closed() {
            0
        } else {
            self.inner.stream_table.len()
        }
    }

    /// Sets the deadline applied to future `accept_stream` calls. `None` disables it.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        *self.inner.accept_deadline.lock().unwrap() = deadline;
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.inner.local_addr
    }

    pub fn remote_addr(&self) -> Option<std::net::SocketAddr> {
        self.inner.remote_addr
    }
}

impl<T> Drop for Session<T> {
    fn drop(&mut self) {
        self.receiver_task.abort();
        self.sender_task.abort();
        if let Some(task) = &self.keepalive_task {
            task.abort();
        }
    }
}

/// Capability alias returned by [`Session::open`]/[`Session::accept`].
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<S: AsyncRead + AsyncWrite + Unpin + Send> AsyncReadWrite for S {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_stream_id_preserves_parity_and_steps_by_two() {
        let inner = test_inner(true);
        assert_eq!(inner.allocate_stream_id().unwrap(), 1);
        assert_eq!(inner.allocate_stream_id().unwrap(), 3);

        let inner = test_inner(false);
        assert_eq!(inner.allocate_stream_id().unwrap(), 0);
        assert_eq!(inner.allocate_stream_id().unwrap(), 2);
    }

    #[test]
    fn allocate_stream_id_go_away_at_wraparound() {
        let inner = test_inner(true);
        inner.next_stream_id.store(u32::MAX - 1, Ordering::Release);
        assert!(matches!(inner.allocate_stream_id(), Err(Error::GoAway)));
        assert!(matches!(inner.allocate_stream_id(), Err(Error::GoAway)));
    }

    fn test_inner(client: bool) -> Inner {
        Inner {
            config: SessionConfig::new(client),
            stream_table: StreamTable::new(),
            bucket: TokenBucket::new(1024),
            shaper: Shaper::new(),
            sequence: AtomicU64::new(0),
            next_stream_id: AtomicU32::new(if client { 1 } else { 0 }),
            go_away: AtomicBool::new(false),
            data_ready: AtomicBool::new(false),
            terminal: OnceLock::new(),
            terminal_notify: Notify::new(),
            accept_deadline: Mutex::new(None),
            local_addr: None,
            remote_addr: None,
        }
    }
}
