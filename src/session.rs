//! Session: owns the transport and multiplexes streams over it.
//!
//! [`SessionBuilder`] provides a fluent API for configuring a session, then
//! starts it in client or server role. A running [`Session`] consists of:
//!
//! 1. A receive loop, the only reader of the transport
//! 2. A send loop, the only writer (see [`crate::writer`])
//! 3. A keepalive task, unless disabled
//!
//! # Example
//!
//! ```no_run
//! use smux::Session;
//! use tokio::net::TcpStream;
//!
//! #[tokio::main]
//! async fn main() -> smux::Result<()> {
//!     let conn = TcpStream::connect("127.0.0.1:7000").await?;
//!     let session = Session::builder()
//!         .version(2)
//!         .max_frame_size(16 * 1024)
//!         .client(conn)?;
//!
//!     let stream = session.open_stream().await?;
//!     stream.write_all(b"ping").await?;
//!     stream.close().await?;
//!     session.close()
//! }
//! ```

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::mpsc;

use crate::alloc::Allocator;
use crate::backpressure::TokenBucket;
use crate::config::Config;
use crate::error::{Result, SmuxError};
use crate::protocol::{Cmd, Header, WindowUpdate, HEADER_SIZE, UPD_SIZE};
use crate::shaper::Shaper;
use crate::signal::{Deadline, Signal};
use crate::stream::{recycle, Stream, StreamInner, OPEN_CLOSE_TIMEOUT};
use crate::writer::{send_loop, Class, Pending, WriteRequest};

/// Streams offered by the peer that may wait for `accept_stream`.
pub const ACCEPT_BACKLOG: usize = 1024;

/// State shared by the session handle, its streams and its tasks.
pub(crate) struct Shared {
    pub(crate) config: Config,
    client: bool,
    pub(crate) bucket: TokenBucket,
    pub(crate) alloc: Arc<Allocator>,
    pub(crate) shaper: Shaper,
    streams: Mutex<HashMap<u32, Arc<StreamInner>>>,
    /// `None` once the id space is used up.
    next_id: Mutex<Option<u32>>,
    seq: AtomicU32,
    /// Set by every inbound frame, cleared by the keepalive check.
    data_ready: AtomicBool,
    pub(crate) die: Signal,
    read_error: Signal,
    write_error: Signal,
    proto_error: Signal,
    accept_deadline: Deadline,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<StreamInner>>>,
}

impl Shared {
    fn lock_streams(&self) -> MutexGuard<'_, HashMap<u32, Arc<StreamInner>>> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lookup(&self, id: u32) -> Option<Arc<StreamInner>> {
        self.lock_streams().get(&id).cloned()
    }

    fn allocate_id(&self) -> Result<u32> {
        let mut next = self.next_id.lock().unwrap_or_else(|e| e.into_inner());
        let Some(id) = *next else {
            return Err(SmuxError::GoAway);
        };
        *next = id.checked_add(2);
        if next.is_none() {
            tracing::warn!(stream_id = id, "stream id space exhausted");
        }
        Ok(id)
    }

    /// Queue a frame for the send loop.
    pub(crate) fn submit(&self, class: Class, cmd: Cmd, stream_id: u32, payload: Bytes) -> Pending {
        let header = Header::new(self.config.version, cmd, payload.len() as u16, stream_id);
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let (request, pending) = WriteRequest::new(class, seq, &header, payload);
        self.shaper.push(request);
        pending
    }

    /// Send a frame without payload, giving up after `timeout` if it has
    /// not been picked up by then.
    pub(crate) async fn write_control(
        &self,
        cmd: Cmd,
        stream_id: u32,
        class: Class,
        timeout: Duration,
    ) -> Result<usize> {
        let mut pending = self.submit(class, cmd, stream_id, Bytes::new());
        let expired = tokio::time::sleep(timeout);

        tokio::select! {
            biased;
            r = pending.result() => r,
            cause = self.terminated() => Err(cause),
            _ = expired => {
                if pending.cancel() {
                    Err(SmuxError::Timeout)
                } else {
                    self.settle(&mut pending).await
                }
            }
        }
    }

    /// Wait for a request that can no longer be withdrawn.
    pub(crate) async fn settle(&self, pending: &mut Pending) -> Result<usize> {
        tokio::select! {
            biased;
            r = pending.result() => r,
            cause = self.terminated() => Err(cause),
        }
    }

    /// First latched transport or protocol error.
    pub(crate) fn error(&self) -> Option<SmuxError> {
        self.read_error
            .cause()
            .or_else(|| self.proto_error.cause())
            .or_else(|| self.write_error.cause())
    }

    /// Resolve when the session ends, with the error blocked callers see.
    pub(crate) async fn terminated(&self) -> SmuxError {
        tokio::select! {
            biased;
            cause = self.read_error.fired() => cause,
            cause = self.proto_error.fired() => cause,
            cause = self.write_error.fired() => cause,
            cause = self.die.fired() => self.error().unwrap_or(cause),
        }
    }

    /// Fire `die` with `cause` and force-close every stream.
    ///
    /// Returns `false` if the session was already closed.
    fn shutdown(&self, cause: SmuxError) -> bool {
        if !self.die.fire(cause) {
            return false;
        }
        let streams = std::mem::take(&mut *self.lock_streams());
        for inner in streams.values() {
            inner.die.fire(SmuxError::BrokenPipe);
        }
        self.bucket.nudge();
        true
    }

    fn fail_read(&self, e: io::Error) {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            tracing::debug!("transport closed by peer");
        } else {
            tracing::error!("transport read failed: {}", e);
        }
        let err = SmuxError::SocketRead(Arc::new(e));
        if self.read_error.fire(err.clone()) {
            self.shutdown(err);
        }
    }

    fn fail_write(&self, err: SmuxError) {
        if self.write_error.fire(err.clone()) {
            self.shutdown(err);
        }
    }

    pub(crate) fn fail_protocol(&self, err: SmuxError) {
        if self.proto_error.fire(err.clone()) {
            self.shutdown(err);
        }
    }

    /// Unregister a locally closed stream and credit its unread bytes back
    /// to the bucket.
    pub(crate) fn stream_closed(&self, inner: &StreamInner) {
        self.lock_streams().remove(&inner.id());
        let reclaimed = inner.drain(&self.alloc);
        self.bucket.release(reclaimed);
    }

    /// No frame arrived since the last check, and not because the bucket
    /// stopped the receive loop.
    fn keepalive_expired(&self) -> bool {
        !self.data_ready.swap(false, Ordering::AcqRel) && self.bucket.has_tokens()
    }

    async fn recv_loop<R>(self: Arc<Self>, mut reader: R, accept_tx: mpsc::Sender<Arc<StreamInner>>)
    where
        R: AsyncRead + Unpin,
    {
        let mut hdr = [0u8; HEADER_SIZE];

        loop {
            while !self.bucket.has_tokens() {
                tokio::select! {
                    biased;
                    _ = self.die.fired() => return,
                    _ = self.bucket.notified() => {}
                }
            }

            tokio::select! {
                biased;
                _ = self.die.fired() => return,
                r = reader.read_exact(&mut hdr) => if let Err(e) = r {
                    self.fail_read(e);
                    return;
                },
            }

            self.data_ready.store(true, Ordering::Release);
            let header = Header::from_bytes(&hdr);
            let cmd = match header.validate(self.config.version) {
                Ok(cmd) => cmd,
                Err(err) => {
                    tracing::warn!("dropping session: {}", err);
                    self.fail_protocol(err);
                    return;
                }
            };
            let sid = header.stream_id;

            match cmd {
                Cmd::Nop => {}
                Cmd::Syn => {
                    let offered = {
                        let mut streams = self.lock_streams();
                        if streams.contains_key(&sid) {
                            None
                        } else {
                            let inner = Arc::new(StreamInner::new(sid));
                            streams.insert(sid, inner.clone());
                            Some(inner)
                        }
                    };
                    if let Some(inner) = offered {
                        tracing::debug!(stream_id = sid, "stream offered by peer");
                        tokio::select! {
                            biased;
                            _ = self.die.fired() => return,
                            r = accept_tx.send(inner) => if r.is_err() {
                                return;
                            },
                        }
                    }
                }
                Cmd::Fin => {
                    if let Some(inner) = self.lookup(sid) {
                        inner.remote_fin();
                    }
                }
                Cmd::Psh => {
                    let len = header.length as usize;
                    if len == 0 {
                        continue;
                    }
                    let mut buf = self.alloc.get(len).unwrap_or_else(|| vec![0u8; len]);
                    tokio::select! {
                        biased;
                        _ = self.die.fired() => return,
                        r = reader.read_exact(&mut buf) => if let Err(e) = r {
                            self.fail_read(e);
                            return;
                        },
                    }

                    // Push under the table lock so a concurrent close either
                    // sees these bytes when it reclaims, or we see it gone.
                    let orphan = {
                        let streams = self.lock_streams();
                        match streams.get(&sid) {
                            Some(inner) => {
                                self.bucket.consume(len);
                                inner.push(buf);
                                None
                            }
                            None => Some(buf),
                        }
                    };
                    if let Some(buf) = orphan {
                        recycle(&self.alloc, buf);
                    }
                }
                Cmd::Upd => {
                    let mut payload = [0u8; UPD_SIZE];
                    tokio::select! {
                        biased;
                        _ = self.die.fired() => return,
                        r = reader.read_exact(&mut payload) => if let Err(e) = r {
                            self.fail_read(e);
                            return;
                        },
                    }
                    if let Some(inner) = self.lookup(sid) {
                        inner.window_update(WindowUpdate::decode(&payload));
                    }
                }
            }
        }
    }

    async fn keepalive(self: Arc<Self>) {
        let interval = self.config.keep_alive_interval;
        let timeout = self.config.keep_alive_timeout;
        let start = tokio::time::Instant::now();
        let mut ping = tokio::time::interval_at(start + interval, interval);
        let mut check = tokio::time::interval_at(start + timeout, timeout);
        let mut last_ping: Option<Pending> = None;

        loop {
            tokio::select! {
                biased;
                _ = self.die.fired() => return,
                _ = ping.tick() => {
                    if !last_ping.as_ref().is_some_and(Pending::is_pending) {
                        last_ping = Some(self.submit(Class::Ctrl, Cmd::Nop, 0, Bytes::new()));
                    }
                    self.bucket.nudge();
                }
                _ = check.tick() => {
                    if self.keepalive_expired() {
                        tracing::warn!("keepalive timeout, closing session");
                        self.shutdown(SmuxError::KeepAliveTimeout);
                        return;
                    }
                }
            }
        }
    }
}

/// Builder for configuring and starting a session.
///
/// Unset fields keep the values of [`Config::default`].
#[derive(Default)]
pub struct SessionBuilder {
    config: Config,
    alloc: Option<Arc<Allocator>>,
}

impl SessionBuilder {
    /// Create a new session builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Set the protocol version (1 or 2).
    ///
    /// Default: 1
    pub fn version(mut self, version: u8) -> Self {
        self.config.version = version;
        self
    }

    /// Disable keepalive pings and the liveness timeout.
    pub fn keep_alive_disabled(mut self, disabled: bool) -> Self {
        self.config.keep_alive_disabled = disabled;
        self
    }

    /// Default: 10 seconds
    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.config.keep_alive_interval = interval;
        self
    }

    /// Must be larger than the interval.
    ///
    /// Default: 30 seconds
    pub fn keep_alive_timeout(mut self, timeout: Duration) -> Self {
        self.config.keep_alive_timeout = timeout;
        self
    }

    /// Default: 32 KiB
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Default: 4 MiB
    pub fn max_receive_buffer(mut self, size: usize) -> Self {
        self.config.max_receive_buffer = size;
        self
    }

    /// Default: 64 KiB
    pub fn max_stream_buffer(mut self, size: usize) -> Self {
        self.config.max_stream_buffer = size;
        self
    }

    /// Use a specific buffer pool instead of the process-wide default.
    pub fn allocator(mut self, alloc: Arc<Allocator>) -> Self {
        self.alloc = Some(alloc);
        self
    }

    /// Start a client session (odd stream ids).
    pub fn client<T>(self, conn: T) -> Result<Session>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.start(conn, true)
    }

    /// Start a server session (even stream ids).
    pub fn server<T>(self, conn: T) -> Result<Session>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.start(conn, false)
    }

    fn start<T>(self, conn: T, client: bool) -> Result<Session>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let alloc = self.alloc.unwrap_or_else(Allocator::shared);
        Session::start(conn, self.config, alloc, client)
    }
}

/// A multiplexing session over one transport connection.
///
/// Handles are cheap to clone. Starting a session spawns its tasks, so it
/// must happen inside a Tokio runtime.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client", &self.shared.client)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Session {
    /// Create a new session builder.
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// Start a client session with `config`.
    pub fn client<T>(conn: T, config: Config) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        SessionBuilder::new().config(config).client(conn)
    }

    /// Start a server session with `config`.
    pub fn server<T>(conn: T, config: Config) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        SessionBuilder::new().config(config).server(conn)
    }

    fn start<T>(conn: T, config: Config, alloc: Arc<Allocator>, client: bool) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        config.validate()?;

        let (reader, writer) = tokio::io::split(conn);
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);

        let shared = Arc::new(Shared {
            bucket: TokenBucket::new(config.max_receive_buffer),
            client,
            alloc,
            shaper: Shaper::new(),
            streams: Mutex::new(HashMap::new()),
            next_id: Mutex::new(Some(if client { 1 } else { 0 })),
            seq: AtomicU32::new(0),
            data_ready: AtomicBool::new(false),
            die: Signal::new(),
            read_error: Signal::new(),
            write_error: Signal::new(),
            proto_error: Signal::new(),
            accept_deadline: Deadline::new(),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            config,
        });

        tokio::spawn(shared.clone().recv_loop(reader, accept_tx));

        let sender = shared.clone();
        tokio::spawn(async move {
            if let Err(err) = send_loop(writer, &sender.shaper, sender.die.fired()).await {
                sender.fail_write(err);
            }
        });

        if !shared.config.keep_alive_disabled {
            tokio::spawn(shared.clone().keepalive());
        }

        tracing::debug!(client, version = shared.config.version, "session started");
        Ok(Self { shared })
    }

    /// Open a new outgoing stream.
    ///
    /// # Errors
    ///
    /// - `BrokenPipe` if the session is closed
    /// - `GoAway` once the stream id space is exhausted; open a new session
    pub async fn open_stream(&self) -> Result<Stream> {
        let sess = &self.shared;
        if sess.die.is_fired() {
            return Err(SmuxError::BrokenPipe);
        }

        let id = sess.allocate_id()?;
        let inner = Arc::new(StreamInner::new(id));
        sess.lock_streams().insert(id, inner.clone());

        let mut opened = sess
            .write_control(Cmd::Syn, id, Class::Ctrl, OPEN_CLOSE_TIMEOUT)
            .await
            .map(|_| ());
        // Closed while the SYN was queued: the table was already cleared.
        if opened.is_ok() && sess.die.is_fired() {
            opened = Err(sess.error().unwrap_or(SmuxError::BrokenPipe));
        }
        if let Err(err) = opened {
            sess.lock_streams().remove(&id);
            return Err(err);
        }

        tracing::debug!(stream_id = id, "stream opened");
        Ok(Stream::new(inner, sess.clone()))
    }

    /// Wait for the peer to open a stream.
    ///
    /// # Errors
    ///
    /// - `Timeout` when the accept deadline passes
    /// - `BrokenPipe` or the terminal cause once the session is closed
    pub async fn accept_stream(&self) -> Result<Stream> {
        let sess = &self.shared;
        let offered = tokio::select! {
            biased;
            cause = sess.terminated() => return Err(cause),
            inner = async { sess.accept_rx.lock().await.recv().await } => inner,
            _ = sess.accept_deadline.expired() => return Err(SmuxError::Timeout),
        };

        match offered {
            Some(inner) => {
                tracing::debug!(stream_id = inner.id(), "stream accepted");
                Ok(Stream::new(inner, sess.clone()))
            }
            None => Err(sess.error().unwrap_or(SmuxError::BrokenPipe)),
        }
    }

    /// Close the session and every stream in it. No FIN frames are sent.
    ///
    /// Only the first call does anything; later calls return `BrokenPipe`.
    pub fn close(&self) -> Result<()> {
        if self.shared.shutdown(SmuxError::BrokenPipe) {
            tracing::debug!("session closed");
            Ok(())
        } else {
            Err(SmuxError::BrokenPipe)
        }
    }

    /// Check if the session has ended.
    pub fn is_closed(&self) -> bool {
        self.shared.die.is_fired()
    }

    /// Resolve once the session ends, with the reason it ended.
    pub async fn closed(&self) -> SmuxError {
        self.shared.die.fired().await
    }

    /// Why the session ended: `BrokenPipe` for a local close,
    /// `KeepAliveTimeout` for a keepalive expiry, or the transport/protocol
    /// error that killed it.
    pub fn close_reason(&self) -> Option<SmuxError> {
        self.shared.die.cause()
    }

    /// Number of registered streams.
    pub fn num_streams(&self) -> usize {
        self.shared.lock_streams().len()
    }

    /// Set the deadline for `accept_stream`; `None` disables it.
    pub fn set_accept_deadline(&self, at: Option<Instant>) {
        self.shared.accept_deadline.set(at);
    }

    pub fn is_client(&self) -> bool {
        self.shared.client
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Unread bytes the receive loop may still admit.
    pub fn available_tokens(&self) -> i64 {
        self.shared.bucket.available()
    }

    #[cfg(test)]
    fn set_next_stream_id(&self, id: u32) {
        *self.shared.next_id.lock().unwrap() = Some(id);
    }
}
