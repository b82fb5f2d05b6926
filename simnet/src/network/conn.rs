//! Simulated stream connection.
//!
//! Each `write()` becomes one SEND and each `read()` that finds nothing
//! buffered becomes one READ. Bytes from a message larger than the caller's
//! buffer are kept locally and served by later reads before any new READ is
//! issued, so the reader sees the exact byte sequence the writer produced.
//!
//! [`SimConn`] also implements tokio's [`AsyncRead`] and [`AsyncWrite`], so
//! code written against those traits runs unchanged over a simulated stream.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, ReusableBoxFuture};
use tracing::{debug, instrument, trace};

use crate::error::{SimNetError, SimNetResult};
use crate::message::Message;
use crate::sim::ops::{Mop, MopHeader, ReadMop, Request, SendMop};
use crate::sim::{lock, SimHandle};
use crate::timer::Timer;
use crate::types::{ConnId, NodeId, SimAddr};

/// Everything needed to build one side of a connection.
#[derive(Debug)]
pub(crate) struct ConnEnds {
    pub(crate) id: ConnId,
    pub(crate) local_node: NodeId,
    pub(crate) remote_node: NodeId,
    pub(crate) local_addr: SimAddr,
    pub(crate) remote_addr: SimAddr,
    pub(crate) node_halt: CancellationToken,
    /// Cancelled when this side closes. It is the peer's `remote_closed`.
    pub(crate) local_closed: CancellationToken,
    pub(crate) remote_closed: CancellationToken,
}

#[derive(Debug, Default)]
struct ReadState {
    leftover: Vec<u8>,
    peer_eof: bool,
}

#[derive(Debug, Default)]
struct Deadlines {
    read: Option<Timer>,
    write: Option<Timer>,
}

/// A deadline and the channel its timer fires on.
type ArmedDeadline = (Instant, watch::Receiver<Option<Instant>>);

#[derive(Debug, Clone, Copy)]
enum Direction {
    Read,
    Write,
}

/// One side of a simulated connection.
///
/// Reads and writes may run concurrently from different tasks; concurrent
/// reads are serialized among themselves, as are concurrent writes.
/// Dropping the connection closes it.
#[derive(Debug)]
pub struct SimConn {
    shared: Arc<ConnShared>,
    io: PollState,
}

/// State shared between the connection and the operations it has in flight.
#[derive(Debug)]
struct ConnShared {
    ends: ConnEnds,
    handle: SimHandle,
    reader: tokio::sync::Mutex<ReadState>,
    writer: tokio::sync::Mutex<()>,
    deadlines: Mutex<Deadlines>,
}

/// Operations started by the `AsyncRead` / `AsyncWrite` impls.
#[derive(Debug)]
struct PollState {
    read: PollSlot<SimNetResult<Vec<u8>>>,
    write: PollSlot<SimNetResult<usize>>,
    /// Bytes a shrunken read buffer could not take.
    unread: Vec<u8>,
}

/// One in-flight operation, resumed across polls until it completes.
struct PollSlot<T> {
    fut: ReusableBoxFuture<'static, T>,
    busy: bool,
}

impl<T: Send + 'static> PollSlot<T> {
    fn new() -> Self {
        Self {
            fut: ReusableBoxFuture::new(std::future::pending()),
            busy: false,
        }
    }

    /// Poll the operation in flight, starting one with `start` if idle.
    fn poll_with<F>(&mut self, cx: &mut Context<'_>, start: impl FnOnce() -> F) -> Poll<T>
    where
        F: Future<Output = T> + Send + 'static,
    {
        if !self.busy {
            self.fut.set(start());
            self.busy = true;
        }
        let out = ready!(self.fut.poll(cx));
        self.busy = false;
        Poll::Ready(out)
    }
}

impl<T> std::fmt::Debug for PollSlot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollSlot").field("busy", &self.busy).finish()
    }
}

impl SimConn {
    pub(crate) fn new(handle: SimHandle, ends: ConnEnds) -> Self {
        Self {
            shared: Arc::new(ConnShared {
                ends,
                handle,
                reader: tokio::sync::Mutex::new(ReadState::default()),
                writer: tokio::sync::Mutex::new(()),
                deadlines: Mutex::new(Deadlines::default()),
            }),
            io: PollState {
                read: PollSlot::new(),
                write: PollSlot::new(),
                unread: Vec::new(),
            },
        }
    }

    /// Identifier of this side.
    pub fn id(&self) -> ConnId {
        self.shared.ends.id
    }

    /// Address of this side's node.
    pub fn local_addr(&self) -> &SimAddr {
        &self.shared.ends.local_addr
    }

    /// Address of the peer's node.
    pub fn remote_addr(&self) -> &SimAddr {
        &self.shared.ends.remote_addr
    }

    /// Node this side is anchored on.
    pub fn local_node(&self) -> NodeId {
        self.shared.ends.local_node
    }

    /// Node the peer side is anchored on.
    pub fn remote_node(&self) -> NodeId {
        self.shared.ends.remote_node
    }

    /// True once `close()` has been called on this side.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Write up to `max_write_size` bytes of `buf` as one message.
    ///
    /// Returns the number of bytes taken. Completes once the bytes are
    /// matched with a read on the other side, or fails with a timeout,
    /// shutdown, partition or end-of-stream error.
    pub async fn write(&self, buf: &[u8]) -> SimNetResult<usize> {
        self.shared.write(buf).await
    }

    /// Write all of `buf`, looping over `write()`.
    pub async fn write_all(&self, mut buf: &[u8]) -> SimNetResult<()> {
        while !buf.is_empty() {
            let n = self.write(buf).await?;
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Send `payload` as a single message, bypassing the per-write cap.
    ///
    /// The dispatcher still enforces `max_message_size`.
    pub async fn send_message(&self, payload: Vec<u8>) -> SimNetResult<()> {
        self.shared.send_message(payload).await
    }

    /// Read into `buf`. Returns `Ok(0)` at end of stream.
    ///
    /// Bytes left over from a previous message are returned first without
    /// touching the network. Once end of stream has been seen, every later
    /// read returns `Ok(0)` immediately.
    pub async fn read(&self, buf: &mut [u8]) -> SimNetResult<usize> {
        self.shared.read(buf).await
    }

    /// Read one whole message.
    ///
    /// Bytes left over from a partial `read()` come back as one message.
    /// Fails with [`SimNetError::Eof`] at end of stream.
    pub async fn read_message(&self) -> SimNetResult<Message> {
        self.shared.read_message().await
    }

    /// Close this side.
    ///
    /// Pending operations on this side fail with end-of-stream; the peer
    /// reads whatever was already written and then end-of-stream. Idempotent.
    pub fn close(&self) -> SimNetResult<()> {
        self.shared.close()
    }

    /// Set both the read and the write deadline. `None` clears them.
    ///
    /// Deadlines latch: once one passes, every operation in that direction
    /// fails with [`SimNetError::Timeout`] until a new deadline is set.
    pub fn set_deadline(&self, at: Option<Instant>) -> SimNetResult<()> {
        let timer = self.shared.arm(at)?;
        let (old_read, old_write) = {
            let mut deadlines = lock(&self.shared.deadlines);
            (
                std::mem::replace(&mut deadlines.read, timer.clone()),
                std::mem::replace(&mut deadlines.write, timer),
            )
        };
        discard_replaced(old_read);
        discard_replaced(old_write);
        Ok(())
    }

    /// Set the read deadline. `None` clears it.
    pub fn set_read_deadline(&self, at: Option<Instant>) -> SimNetResult<()> {
        let timer = self.shared.arm(at)?;
        let old = std::mem::replace(&mut lock(&self.shared.deadlines).read, timer);
        discard_replaced(old);
        Ok(())
    }

    /// Set the write deadline. `None` clears it.
    pub fn set_write_deadline(&self, at: Option<Instant>) -> SimNetResult<()> {
        let timer = self.shared.arm(at)?;
        let old = std::mem::replace(&mut lock(&self.shared.deadlines).write, timer);
        discard_replaced(old);
        Ok(())
    }

    /// Mark closed without telling the dispatcher. Used for connections
    /// that never made it into the dispatcher's tables.
    pub(crate) fn disarm(&self) {
        self.shared.ends.local_closed.cancel();
    }
}

impl ConnShared {
    fn is_closed(&self) -> bool {
        self.ends.local_closed.is_cancelled()
    }

    #[instrument(level = "trace", skip(self, buf), fields(conn = %self.ends.id, len = buf.len()))]
    async fn write(&self, buf: &[u8]) -> SimNetResult<usize> {
        if self.is_closed() {
            return Err(SimNetError::ClosedConnection);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let _writer = self.writer.lock().await;
        let n = buf.len().min(self.handle.config().max_write_size);
        self.send(Message::copy_from(&buf[..n])).await?;
        Ok(n)
    }

    async fn send_message(&self, payload: Vec<u8>) -> SimNetResult<()> {
        if self.is_closed() {
            return Err(SimNetError::ClosedConnection);
        }
        let _writer = self.writer.lock().await;
        self.send(Message::new(payload)).await
    }

    #[instrument(level = "trace", skip(self, buf), fields(conn = %self.ends.id, cap = buf.len()))]
    async fn read(&self, buf: &mut [u8]) -> SimNetResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.reader.lock().await;
        if !state.leftover.is_empty() {
            let n = buf.len().min(state.leftover.len());
            buf[..n].copy_from_slice(&state.leftover[..n]);
            state.leftover.drain(..n);
            return Ok(n);
        }
        if state.peer_eof || self.is_closed() {
            return Ok(0);
        }

        let msg = match self.receive().await {
            Ok(msg) => msg,
            Err(SimNetError::Eof) => {
                state.peer_eof = true;
                return Ok(0);
            }
            Err(err) => return Err(err),
        };
        if msg.is_eof() {
            state.peer_eof = true;
        }
        let payload = msg.payload();
        let n = buf.len().min(payload.len());
        buf[..n].copy_from_slice(&payload[..n]);
        if n < payload.len() {
            state.leftover.extend_from_slice(&payload[n..]);
        }
        trace!(serial = msg.serial(), n, kept = payload.len() - n, "read");
        Ok(n)
    }

    async fn read_message(&self) -> SimNetResult<Message> {
        let mut state = self.reader.lock().await;
        if !state.leftover.is_empty() {
            return Ok(Message::new(std::mem::take(&mut state.leftover)));
        }
        if state.peer_eof || self.is_closed() {
            return Err(SimNetError::Eof);
        }
        match self.receive().await {
            Ok(msg) if msg.is_eof() => {
                state.peer_eof = true;
                Err(SimNetError::Eof)
            }
            Ok(msg) => Ok(msg),
            Err(SimNetError::Eof) => {
                state.peer_eof = true;
                Err(SimNetError::Eof)
            }
            Err(err) => Err(err),
        }
    }

    fn close(&self) -> SimNetResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        let eof = SendMop {
            header: self.header(None),
            conn: self.ends.id,
            msg: Message::eof(),
            done: None,
        };
        // The EOF must be queued before the peer can observe `remote_closed`.
        let submitted = self.handle.submit(Request::Op(Mop::Send(eof)));
        self.ends.local_closed.cancel();
        self.clear_deadlines();
        debug!(conn = %self.ends.id, local = %self.ends.local_addr, "connection closed");
        // A halted simulation has nobody left to notify.
        match submitted {
            Err(SimNetError::Shutdown) | Ok(()) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn arm(&self, at: Option<Instant>) -> SimNetResult<Option<Timer>> {
        at.map(|at| {
            self.handle
                .arm_timer(self.ends.local_node, &self.ends.node_halt, at)
        })
        .transpose()
    }

    fn clear_deadlines(&self) {
        let (read, write) = {
            let mut deadlines = lock(&self.deadlines);
            (deadlines.read.take(), deadlines.write.take())
        };
        discard_replaced(read);
        discard_replaced(write);
    }

    fn deadline(&self, direction: Direction) -> Option<ArmedDeadline> {
        let deadlines = lock(&self.deadlines);
        let timer = match direction {
            Direction::Read => deadlines.read.as_ref(),
            Direction::Write => deadlines.write.as_ref(),
        };
        timer.map(|timer| (timer.deadline(), timer.subscribe()))
    }

    fn header(&self, deadline: Option<Instant>) -> MopHeader {
        MopHeader::new(self.ends.local_node, self.ends.remote_node, deadline)
    }

    async fn send(&self, msg: Message) -> SimNetResult<()> {
        let deadline = self.deadline(Direction::Write);
        check_not_expired(&deadline)?;
        let (done, outcome) = oneshot::channel();
        self.handle.submit(Request::Op(Mop::Send(SendMop {
            header: self.header(deadline.as_ref().map(|(at, _)| *at)),
            conn: self.ends.id,
            msg,
            done: Some(done),
        })))?;
        self.await_outcome(outcome, deadline.map(|(_, fired)| fired), true)
            .await
    }

    async fn receive(&self) -> SimNetResult<Message> {
        let deadline = self.deadline(Direction::Read);
        check_not_expired(&deadline)?;
        let (done, outcome) = oneshot::channel();
        self.handle.submit(Request::Op(Mop::Read(ReadMop {
            header: self.header(deadline.as_ref().map(|(at, _)| *at)),
            conn: self.ends.id,
            done,
        })))?;
        // Reads never race the remote close: the peer's EOF is queued
        // behind its data and arrives through the dispatcher.
        self.await_outcome(outcome, deadline.map(|(_, fired)| fired), false)
            .await
    }

    /// Wait for the dispatcher's verdict, or give up on the first of halt,
    /// deadline or close. A verdict that landed while giving up still wins.
    async fn await_outcome<T>(
        &self,
        mut outcome: oneshot::Receiver<SimNetResult<T>>,
        deadline: Option<watch::Receiver<Option<Instant>>>,
        watch_remote: bool,
    ) -> SimNetResult<T> {
        let interrupted = tokio::select! {
            resolved = &mut outcome => {
                return resolved.unwrap_or(Err(SimNetError::Shutdown));
            }
            _ = self.handle.halt().cancelled() => SimNetError::Shutdown,
            _ = self.ends.node_halt.cancelled() => SimNetError::Shutdown,
            _ = deadline_passed(deadline) => SimNetError::Timeout,
            _ = self.ends.local_closed.cancelled() => SimNetError::Eof,
            _ = remote_closed(&self.ends.remote_closed, watch_remote) => SimNetError::Eof,
        };
        outcome.close();
        match outcome.try_recv() {
            Ok(resolved) => resolved,
            Err(_) => {
                trace!(conn = %self.ends.id, err = %interrupted, "operation abandoned");
                Err(interrupted)
            }
        }
    }
}

impl AsyncRead for SimConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        if !this.io.unread.is_empty() {
            let n = buf.remaining().min(this.io.unread.len());
            buf.put_slice(&this.io.unread[..n]);
            this.io.unread.drain(..n);
            return Poll::Ready(Ok(()));
        }

        let shared = Arc::clone(&this.shared);
        let cap = buf.remaining();
        let chunk = ready!(this.io.read.poll_with(cx, move || async move {
            let mut chunk = vec![0u8; cap];
            let n = shared.read(&mut chunk).await?;
            chunk.truncate(n);
            Ok::<_, SimNetError>(chunk)
        }))?;

        // An empty chunk leaves `buf` untouched, which signals end of stream.
        let n = buf.remaining().min(chunk.len());
        buf.put_slice(&chunk[..n]);
        this.io.unread.extend_from_slice(&chunk[n..]);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for SimConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let shared = Arc::clone(&this.shared);
        let take = buf.len().min(shared.handle.config().max_write_size);
        let written = ready!(this.io.write.poll_with(cx, || {
            let chunk = buf[..take].to_vec();
            async move { shared.write(&chunk).await }
        }));
        Poll::Ready(written.map_err(io::Error::from))
    }

    /// Writes complete only once matched, so there is never anything to flush.
    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.shared.close().map_err(io::Error::from))
    }
}

impl Drop for SimConn {
    fn drop(&mut self) {
        let _ = self.shared.close();
    }
}

/// A deadline already in the past fails the operation before it is submitted.
fn check_not_expired(deadline: &Option<ArmedDeadline>) -> SimNetResult<()> {
    match deadline {
        Some((at, _)) if *at <= Instant::now() => Err(SimNetError::Timeout),
        _ => Ok(()),
    }
}

fn discard_replaced(timer: Option<Timer>) {
    if let Some(timer) = timer {
        timer.discard_detached();
    }
}

async fn deadline_passed(deadline: Option<watch::Receiver<Option<Instant>>>) {
    if let Some(mut fired) = deadline {
        let passed = fired.wait_for(Option::is_some).await.is_ok();
        if passed {
            return;
        }
    }
    // No deadline, or it was discarded while we waited.
    std::future::pending::<()>().await
}

async fn remote_closed(token: &CancellationToken, watch: bool) {
    if watch {
        token.cancelled().await
    } else {
        std::future::pending::<()>().await
    }
}
