//! Error types for smux.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Main error type for all session and stream operations.
///
/// The type is `Clone` so that a terminal cause latched by one of the session
/// loops can be handed to every blocked caller. I/O causes are therefore kept
/// behind an `Arc`.
#[derive(Debug, Clone, Error)]
pub enum SmuxError {
    /// The session or stream is closed locally.
    #[error("broken pipe")]
    BrokenPipe,

    /// The remote side closed the stream (FIN received); no more writes.
    #[error("stream closed by peer")]
    RemoteClosed,

    /// Deadline expired. The stream or session stays usable.
    #[error("timeout")]
    Timeout,

    /// No frame arrived within the keepalive timeout; the session is gone.
    #[error("keepalive timeout")]
    KeepAliveTimeout,

    /// Stream id space exhausted; open a new session.
    #[error("stream id space exhausted, session going away")]
    GoAway,

    /// Protocol violation by the peer (bad version, unknown command, malformed frame).
    #[error("invalid protocol: {0}")]
    Protocol(String),

    /// Peer reported more bytes consumed than were ever sent on the stream.
    #[error("peer consumed more than sent")]
    Consumed,

    /// Reading the underlying transport failed.
    #[error("socket read error: {0}")]
    SocketRead(Arc<io::Error>),

    /// Writing the underlying transport failed.
    #[error("socket write error: {0}")]
    SocketWrite(Arc<io::Error>),

    /// I/O error on a caller-supplied sink (see `Stream::copy_to`).
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    Config(String),

    /// Allocator misuse (returning a buffer that was not handed out by the pool).
    #[error("allocator misuse: {0}")]
    Alloc(String),
}

impl SmuxError {
    /// Check if this is a deadline expiry (as opposed to a permanent failure).
    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self, SmuxError::Timeout)
    }

    /// Check if this error ended the whole session.
    ///
    /// `BrokenPipe` counts as fatal; a locally closed stream reports it too.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SmuxError::Protocol(_)
                | SmuxError::Consumed
                | SmuxError::KeepAliveTimeout
                | SmuxError::SocketRead(_)
                | SmuxError::SocketWrite(_)
                | SmuxError::BrokenPipe
        )
    }
}

impl From<io::Error> for SmuxError {
    fn from(e: io::Error) -> Self {
        SmuxError::Io(Arc::new(e))
    }
}

impl From<SmuxError> for io::Error {
    fn from(e: SmuxError) -> Self {
        let kind = match &e {
            SmuxError::BrokenPipe | SmuxError::RemoteClosed => io::ErrorKind::BrokenPipe,
            SmuxError::Timeout | SmuxError::KeepAliveTimeout => io::ErrorKind::TimedOut,
            SmuxError::Protocol(_) | SmuxError::Consumed => io::ErrorKind::InvalidData,
            SmuxError::Config(_) | SmuxError::Alloc(_) => io::ErrorKind::InvalidInput,
            SmuxError::SocketRead(inner) | SmuxError::SocketWrite(inner) | SmuxError::Io(inner) => {
                inner.kind()
            }
            SmuxError::GoAway => io::ErrorKind::Other,
        };
        io::Error::new(kind, e)
    }
}

/// Result type alias using SmuxError.
pub type Result<T> = std::result::Result<T, SmuxError>;
