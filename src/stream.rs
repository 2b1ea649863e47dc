//! Logical streams.
//!
//! A [`Stream`] is one bidirectional byte pipe inside a session. Inbound
//! payloads are parked in a per-stream queue of pooled buffers by the
//! receive loop; outbound writes are split into frames and handed to the
//! shaper.
//!
//! # Lifecycle
//!
//! ```text
//! OPEN ──FIN received──► HALF-CLOSED (reads drain, then EOF; writes fail)
//!   │                        │
//!   └──────close()───────────┴──► CLOSED (FIN sent, leftovers reclaimed)
//! ```
//!
//! # Flow control
//!
//! Every byte copied out of a stream is credited back to the session's token
//! bucket. Under protocol v2 the reader also reports cumulative consumption
//! to the peer with `UPD` frames, and the writer never puts more than the
//! peer's advertised window in flight.

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{ready, Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::Notify;

use crate::alloc::Allocator;
use crate::config::Config;
use crate::error::{Result, SmuxError};
use crate::protocol::{Cmd, WindowUpdate};
use crate::session::Shared;
use crate::signal::{Deadline, Signal};
use crate::writer::{Class, Pending};

/// Window assumed for the peer until its first `UPD` arrives (v2).
pub const INITIAL_PEER_WINDOW: u32 = 262_144;

/// How long a SYN or FIN may wait in the send queue.
pub const OPEN_CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

/// One received payload, partially consumed from `pos`.
#[derive(Debug)]
struct Chunk {
    buf: Vec<u8>,
    pos: usize,
}

#[derive(Debug, Default)]
struct RecvState {
    chunks: VecDeque<Chunk>,
    /// Unread bytes across `chunks`.
    buffered: usize,
    /// v2: cumulative bytes handed to the application (wrapping).
    num_read: u32,
    /// v2: bytes read since the last `UPD`.
    incr: usize,
}

impl RecvState {
    /// Copy as much as fits into `out`, recycling drained buffers.
    fn copy_out(&mut self, out: &mut [u8], alloc: &Allocator) -> usize {
        let mut n = 0;
        while n < out.len() {
            let Some(chunk) = self.chunks.front_mut() else {
                break;
            };
            let avail = &chunk.buf[chunk.pos..];
            let k = avail.len().min(out.len() - n);
            out[n..n + k].copy_from_slice(&avail[..k]);
            chunk.pos += k;
            n += k;

            if chunk.pos == chunk.buf.len() {
                if let Some(done) = self.chunks.pop_front() {
                    recycle(alloc, done.buf);
                }
            }
        }
        self.buffered -= n;
        n
    }

    /// Take the front chunk whole.
    fn pop_chunk(&mut self) -> Option<Chunk> {
        let chunk = self.chunks.pop_front()?;
        self.buffered -= chunk.buf.len() - chunk.pos;
        Some(chunk)
    }

    /// Record `n` consumed bytes; returns the value to report in a `UPD` if
    /// one is due.
    fn account(&mut self, n: usize, max_stream_buffer: usize) -> Option<u32> {
        self.num_read = self.num_read.wrapping_add(n as u32);
        self.incr += n;
        let first = self.num_read == n as u32;
        if first || self.incr >= max_stream_buffer / 2 {
            self.incr = 0;
            Some(self.num_read)
        } else {
            None
        }
    }
}

/// Return a pooled buffer; foreign buffers are simply dropped.
pub(crate) fn recycle(alloc: &Allocator, buf: Vec<u8>) {
    if let Err(e) = alloc.put(buf) {
        tracing::debug!("buffer not recycled: {}", e);
    }
}

/// State shared between a [`Stream`] handle and the session.
#[derive(Debug)]
pub(crate) struct StreamInner {
    id: u32,
    recv: Mutex<RecvState>,
    read_event: Notify,
    update_event: Notify,
    /// Local close.
    pub(crate) die: Signal,
    fin: AtomicBool,
    read_deadline: Deadline,
    write_deadline: Deadline,
    num_written: AtomicU32,
    peer_consumed: AtomicU32,
    peer_window: AtomicU32,
}

impl StreamInner {
    pub(crate) fn new(id: u32) -> Self {
        Self {
            id,
            recv: Mutex::new(RecvState::default()),
            read_event: Notify::new(),
            update_event: Notify::new(),
            die: Signal::new(),
            fin: AtomicBool::new(false),
            read_deadline: Deadline::new(),
            write_deadline: Deadline::new(),
            num_written: AtomicU32::new(0),
            peer_consumed: AtomicU32::new(0),
            peer_window: AtomicU32::new(INITIAL_PEER_WINDOW),
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    fn lock_recv(&self) -> MutexGuard<'_, RecvState> {
        self.recv.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue an inbound payload (receive loop).
    pub(crate) fn push(&self, buf: Vec<u8>) {
        {
            let mut recv = self.lock_recv();
            recv.buffered += buf.len();
            recv.chunks.push_back(Chunk { buf, pos: 0 });
        }
        self.read_event.notify_waiters();
    }

    /// Peer sent FIN (receive loop).
    pub(crate) fn remote_fin(&self) {
        self.fin.store(true, Ordering::Release);
        self.read_event.notify_waiters();
        self.update_event.notify_waiters();
    }

    /// Peer sent UPD (receive loop).
    pub(crate) fn window_update(&self, update: WindowUpdate) {
        self.peer_consumed.store(update.consumed, Ordering::Release);
        self.peer_window.store(update.window, Ordering::Release);
        self.update_event.notify_waiters();
    }

    /// Drop every unread chunk and return how many bytes they held.
    pub(crate) fn drain(&self, alloc: &Allocator) -> usize {
        let chunks = {
            let mut recv = self.lock_recv();
            recv.buffered = 0;
            std::mem::take(&mut recv.chunks)
        };
        chunks
            .into_iter()
            .map(|chunk| {
                let n = chunk.buf.len() - chunk.pos;
                recycle(alloc, chunk.buf);
                n
            })
            .sum()
    }

    fn is_fin(&self) -> bool {
        self.fin.load(Ordering::Acquire)
    }

    /// Bytes the writer may still put in flight (v2).
    fn send_window(&self) -> Result<i64> {
        let written = self.num_written.load(Ordering::Acquire);
        let consumed = self.peer_consumed.load(Ordering::Acquire);
        let inflight = written.wrapping_sub(consumed) as i32;
        if inflight < 0 {
            return Err(SmuxError::Consumed);
        }
        Ok(self.peer_window.load(Ordering::Acquire) as i64 - inflight as i64)
    }
}

/// A multiplexed stream.
///
/// Handles are cheap to clone; all clones refer to the same stream.
/// Concurrent reads (or concurrent writes) through several clones are
/// allowed, but their interleaving is unspecified.
///
/// Dropping a handle does not close the stream; call [`close`](Self::close).
///
/// `Stream` also implements [`AsyncRead`] and [`AsyncWrite`], so it can be
/// handed to `tokio::io::copy_bidirectional`, a `BufReader` or a codec.
/// `poll_shutdown` closes the stream. Each handle keeps its own in-flight
/// operation; a clone starts idle.
pub struct Stream {
    inner: Arc<StreamInner>,
    sess: Arc<Shared>,
    adapter: Mutex<Adapter>,
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Operations started by the poll-based impls and not finished yet.
#[derive(Default)]
struct Adapter {
    read: Option<BoxFuture<Result<Vec<u8>>>>,
    /// Bytes read but not yet taken by a smaller `ReadBuf`.
    leftover: Vec<u8>,
    write: Option<BoxFuture<Result<usize>>>,
    shutdown: Option<BoxFuture<Result<()>>>,
}

impl Clone for Stream {
    fn clone(&self) -> Self {
        Self::new(self.inner.clone(), self.sess.clone())
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").field("id", &self.inner.id).finish()
    }
}

impl Stream {
    pub(crate) fn new(inner: Arc<StreamInner>, sess: Arc<Shared>) -> Self {
        Self {
            inner,
            sess,
            adapter: Mutex::default(),
        }
    }

    /// Stream identifier.
    #[inline]
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Unread bytes currently buffered.
    pub fn buffered_len(&self) -> usize {
        self.inner.lock_recv().buffered
    }

    /// Read into `buf`.
    ///
    /// Returns as soon as any data is buffered. `Ok(0)` means the peer closed
    /// the stream and everything it sent has been read.
    ///
    /// # Errors
    ///
    /// - `Timeout` when the read deadline passes (the stream stays usable)
    /// - `BrokenPipe` after a local close or session close
    /// - the session's terminal cause after a transport or protocol failure
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            let ready = self.inner.read_event.notified();
            tokio::pin!(ready);
            ready.as_mut().enable();

            if let Some(err) = self.closed_here() {
                return Err(err);
            }
            if let Some(n) = self.try_read(buf) {
                return Ok(n);
            }
            if let Some(err) = self.read_failure() {
                return Err(err);
            }

            tokio::select! {
                biased;
                cause = self.sess.terminated() => return Err(cause),
                cause = self.inner.die.fired() => return Err(cause),
                _ = &mut ready => {}
                _ = self.inner.read_deadline.expired() => return Err(SmuxError::Timeout),
            }
        }
    }

    /// Non-blocking read core. `None` means nothing to hand out yet.
    fn try_read(&self, buf: &mut [u8]) -> Option<usize> {
        let (n, update) = {
            let mut recv = self.inner.lock_recv();
            let n = recv.copy_out(buf, &self.sess.alloc);
            if n == 0 {
                return self.inner.is_fin().then_some(0);
            }
            (n, self.account(&mut recv, n))
        };

        self.consumed(n, update);
        Some(n)
    }

    fn account(&self, recv: &mut RecvState, n: usize) -> Option<u32> {
        if self.sess.config.flow_control() {
            recv.account(n, self.sess.config.max_stream_buffer)
        } else {
            None
        }
    }

    /// Credit the bucket and report consumption to the peer if due.
    fn consumed(&self, n: usize, update: Option<u32>) {
        self.sess.bucket.release(n);
        if let Some(consumed) = update {
            self.send_window_update(consumed);
        }
    }

    /// Queue a `UPD` without waiting for it to be written.
    fn send_window_update(&self, consumed: u32) {
        let update = WindowUpdate {
            consumed,
            window: self.sess.config.max_stream_buffer as u32,
        };
        let payload = Bytes::copy_from_slice(&update.encode());
        drop(self.sess.submit(Class::Ctrl, Cmd::Upd, self.inner.id, payload));
    }

    /// This side closed the stream or the session. Buffered data is no
    /// longer handed out; after a transport or protocol failure it still is.
    fn closed_here(&self) -> Option<SmuxError> {
        if !self.inner.die.is_fired() || self.sess.error().is_some() {
            return None;
        }
        Some(self.sess.die.cause().unwrap_or(SmuxError::BrokenPipe))
    }

    fn read_failure(&self) -> Option<SmuxError> {
        self.sess
            .error()
            .or_else(|| self.inner.die.cause())
            .or_else(|| self.sess.die.is_fired().then_some(SmuxError::BrokenPipe))
    }

    fn write_failure(&self) -> Option<SmuxError> {
        if let Some(err) = self.read_failure() {
            return Some(err);
        }
        self.inner.is_fin().then_some(SmuxError::RemoteClosed)
    }

    /// Write `data`, split into frames of at most `max_frame_size` bytes.
    ///
    /// Frames of one call reach the peer in order. Returns the number of
    /// bytes accepted by the transport; a short count means the call was
    /// interrupted (deadline, close, FIN) after some data went out, and the
    /// next call reports why.
    ///
    /// Under protocol v2 the call blocks while the peer's window is full.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        if let Some(err) = self.write_failure() {
            return Err(err);
        }
        if data.is_empty() {
            return Ok(0);
        }
        if self.inner.write_deadline.is_expired() {
            return Err(SmuxError::Timeout);
        }

        if self.sess.config.flow_control() {
            self.write_windowed(data).await
        } else {
            let (sent, err) = self.send_frames(data).await;
            partial(sent, err)
        }
    }

    /// v2 write: never exceed the peer's advertised window.
    async fn write_windowed(&self, data: &[u8]) -> Result<usize> {
        let mut sent = 0;

        loop {
            let updated = self.inner.update_event.notified();
            tokio::pin!(updated);
            updated.as_mut().enable();

            if let Some(err) = self.write_failure() {
                return partial(sent, Some(err));
            }

            let win = match self.inner.send_window() {
                Ok(win) => win,
                Err(err) => {
                    tracing::warn!(
                        stream_id = self.inner.id,
                        "peer reported more bytes consumed than were sent"
                    );
                    self.sess.fail_protocol(err.clone());
                    return partial(sent, Some(err));
                }
            };

            if win > 0 {
                let n = (win as usize).min(data.len() - sent);
                let (written, err) = self.send_frames(&data[sent..sent + n]).await;
                sent += written;
                if err.is_some() || sent == data.len() {
                    return partial(sent, err);
                }
                continue;
            }

            tokio::select! {
                biased;
                cause = self.sess.terminated() => return partial(sent, Some(cause)),
                cause = self.inner.die.fired() => return partial(sent, Some(cause)),
                _ = &mut updated => {}
                _ = self.inner.write_deadline.expired() => {
                    return partial(sent, Some(SmuxError::Timeout));
                }
            }
        }
    }

    /// Submit every frame of `data` at once, then collect the results in
    /// order. On interruption, frames the send loop has not claimed yet are
    /// withdrawn so nothing unreported reaches the wire.
    async fn send_frames(&self, data: &[u8]) -> (usize, Option<SmuxError>) {
        let frame_size = self.sess.config.max_frame_size;
        self.inner
            .num_written
            .fetch_add(data.len() as u32, Ordering::AcqRel);

        let mut pendings: VecDeque<Pending> = data
            .chunks(frame_size)
            .map(|frame| {
                let payload = Bytes::copy_from_slice(frame);
                self.sess
                    .submit(Class::Data, Cmd::Psh, self.inner.id, payload)
            })
            .collect();

        let mut written = 0;
        while let Some(mut pending) = pendings.pop_front() {
            let stop = tokio::select! {
                biased;
                r = pending.result() => match r {
                    Ok(n) => {
                        written += n;
                        continue;
                    }
                    Err(err) => return (written, Some(err)),
                },
                cause = self.sess.terminated() => return (written, Some(cause)),
                cause = self.inner.die.fired() => cause,
                _ = self.inner.write_deadline.expired() => SmuxError::Timeout,
            };

            pendings.push_front(pending);
            written += self.withdraw(pendings).await;
            return (written, Some(stop));
        }

        (written, None)
    }

    /// Cancel the unclaimed tail of `pendings` and wait out the claimed
    /// head. Returns the bytes that still made it out.
    async fn withdraw(&self, mut pendings: VecDeque<Pending>) -> usize {
        // The send loop claims a stream's frames front to back; cancelling
        // back to front leaves no gap between the two.
        let mut keep = pendings.len();
        let mut cancelled = 0;
        for (i, pending) in pendings.iter().enumerate().rev() {
            if !pending.cancel() {
                break;
            }
            keep = i;
            cancelled += pending.len();
        }
        pendings.truncate(keep);
        self.inner
            .num_written
            .fetch_sub(cancelled as u32, Ordering::AcqRel);

        let mut written = 0;
        for mut pending in pendings {
            match self.sess.settle(&mut pending).await {
                Ok(n) => written += n,
                Err(_) => break,
            }
        }
        written
    }

    /// Write the whole buffer, looping over short writes.
    pub async fn write_all(&self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let n = self.write(data).await?;
            if n == 0 {
                return Err(SmuxError::BrokenPipe);
            }
            data = &data[n..];
        }
        Ok(())
    }

    /// Move everything the peer sends into `writer` until EOF.
    ///
    /// Buffered chunks are written out directly, without an intermediate
    /// copy. Returns the number of bytes moved.
    pub async fn copy_to<W>(&self, writer: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut total = 0u64;

        loop {
            let ready = self.inner.read_event.notified();
            tokio::pin!(ready);
            ready.as_mut().enable();

            if let Some(err) = self.closed_here() {
                return Err(err);
            }
            let popped = {
                let mut recv = self.inner.lock_recv();
                recv.pop_chunk().map(|chunk| {
                    let n = chunk.buf.len() - chunk.pos;
                    let update = self.account(&mut recv, n);
                    (chunk, n, update)
                })
            };

            if let Some((chunk, n, update)) = popped {
                self.consumed(n, update);
                let res = writer.write_all(&chunk.buf[chunk.pos..]).await;
                recycle(&self.sess.alloc, chunk.buf);
                res?;
                total += n as u64;
                continue;
            }

            if self.inner.is_fin() {
                writer.flush().await?;
                return Ok(total);
            }
            if let Some(err) = self.read_failure() {
                return Err(err);
            }

            tokio::select! {
                biased;
                cause = self.sess.terminated() => return Err(cause),
                cause = self.inner.die.fired() => return Err(cause),
                _ = &mut ready => {}
                _ = self.inner.read_deadline.expired() => return Err(SmuxError::Timeout),
            }
        }
    }

    /// Close the stream: send FIN and give unread bytes back to the session.
    ///
    /// Only the first call does anything; later calls return `BrokenPipe`.
    pub async fn close(&self) -> Result<()> {
        if !self.inner.die.fire(SmuxError::BrokenPipe) {
            return Err(SmuxError::BrokenPipe);
        }

        let sent = self
            .sess
            .write_control(Cmd::Fin, self.inner.id, Class::Data, OPEN_CLOSE_TIMEOUT)
            .await;
        self.sess.stream_closed(&self.inner);
        tracing::debug!(stream_id = self.inner.id, "stream closed");
        sent.map(|_| ())
    }

    /// Resolve once the stream is closed locally or its session ends.
    pub async fn closed(&self) {
        tokio::select! {
            _ = self.inner.die.fired() => {}
            _ = self.sess.die.fired() => {}
        }
    }

    /// Set the read deadline; `None` disables it. Blocked reads pick up the
    /// new value immediately.
    pub fn set_read_deadline(&self, at: Option<Instant>) {
        self.inner.read_deadline.set(at);
    }

    /// Set the write deadline; `None` disables it.
    pub fn set_write_deadline(&self, at: Option<Instant>) {
        self.inner.write_deadline.set(at);
    }

    /// Set both deadlines.
    pub fn set_deadline(&self, at: Option<Instant>) {
        self.set_read_deadline(at);
        self.set_write_deadline(at);
    }

    /// The configuration of the owning session.
    pub fn config(&self) -> &Config {
        &self.sess.config
    }
}

async fn read_owned(stream: Stream, len: usize) -> Result<Vec<u8>> {
    let mut data = vec![0u8; len];
    let n = stream.read(&mut data).await?;
    data.truncate(n);
    Ok(data)
}

async fn write_owned(stream: Stream, data: Vec<u8>) -> Result<usize> {
    stream.write(&data).await
}

async fn close_owned(stream: Stream) -> Result<()> {
    match stream.close().await {
        // Already closed: shutting down twice is fine.
        Err(SmuxError::BrokenPipe) => Ok(()),
        other => other,
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        let adapter = this.adapter.get_mut().unwrap_or_else(|e| e.into_inner());

        if adapter.leftover.is_empty() {
            let len = buf.remaining();
            let fut = adapter.read.get_or_insert_with(|| {
                let handle = Stream::new(this.inner.clone(), this.sess.clone());
                Box::pin(read_owned(handle, len))
            });
            let result = ready!(fut.as_mut().poll(cx));
            adapter.read = None;
            match result {
                // Empty means EOF: leave `buf` untouched.
                Ok(data) => adapter.leftover = data,
                Err(err) => return Poll::Ready(Err(err.into())),
            }
        }

        let n = buf.remaining().min(adapter.leftover.len());
        buf.put_slice(&adapter.leftover[..n]);
        adapter.leftover.drain(..n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let adapter = this.adapter.get_mut().unwrap_or_else(|e| e.into_inner());

        // A pending write keeps its bytes; the caller retries with the same buffer.
        let fut = adapter.write.get_or_insert_with(|| {
            let handle = Stream::new(this.inner.clone(), this.sess.clone());
            Box::pin(write_owned(handle, buf.to_vec()))
        });
        let result = ready!(fut.as_mut().poll(cx));
        adapter.write = None;
        Poll::Ready(result.map_err(io::Error::from))
    }

    /// Frames are on the transport once `poll_write` returns.
    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let adapter = this.adapter.get_mut().unwrap_or_else(|e| e.into_inner());

        let fut = adapter.shutdown.get_or_insert_with(|| {
            let handle = Stream::new(this.inner.clone(), this.sess.clone());
            Box::pin(close_owned(handle))
        });
        let result = ready!(fut.as_mut().poll(cx));
        adapter.shutdown = None;
        Poll::Ready(result.map_err(io::Error::from))
    }
}

/// Report a short write as success and let the next call surface the error.
fn partial(sent: usize, err: Option<SmuxError>) -> Result<usize> {
    match err {
        Some(err) if sent == 0 => Err(err),
        _ => Ok(sent),
    }
}
