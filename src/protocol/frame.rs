//! Frame struct with typed accessors.
//!
//! Represents a complete protocol frame: version, command, stream id and
//! payload. Uses `bytes::Bytes` for zero-copy payload sharing with the send
//! loop.
//!
//! # Example
//!
//! ```
//! use smux::protocol::{Cmd, Frame};
//! use bytes::Bytes;
//!
//! let frame = Frame::with_data(1, Cmd::Psh, 3, Bytes::from_static(b"hello"));
//! assert_eq!(frame.stream_id(), 3);
//! assert_eq!(frame.encode().len(), 8 + 5);
//! ```

use bytes::Bytes;

use super::wire_format::{Cmd, Header, WindowUpdate, HEADER_SIZE};

/// A complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Protocol version.
    pub version: u8,
    /// Command.
    pub cmd: Cmd,
    /// Stream identifier.
    pub stream_id: u32,
    /// Payload bytes, only non-empty for `PSH` and `UPD`.
    pub data: Bytes,
}

impl Frame {
    /// Create a frame without payload.
    pub fn new(version: u8, cmd: Cmd, stream_id: u32) -> Self {
        Self {
            version,
            cmd,
            stream_id,
            data: Bytes::new(),
        }
    }

    /// Create a frame carrying a payload.
    ///
    /// The caller guarantees `data.len() <= 65535`.
    pub fn with_data(version: u8, cmd: Cmd, stream_id: u32, data: Bytes) -> Self {
        debug_assert!(data.len() <= u16::MAX as usize);
        Self {
            version,
            cmd,
            stream_id,
            data,
        }
    }

    /// Create a `UPD` frame.
    pub fn window_update(version: u8, stream_id: u32, update: WindowUpdate) -> Self {
        Self::with_data(
            version,
            Cmd::Upd,
            stream_id,
            Bytes::copy_from_slice(&update.encode()),
        )
    }

    /// Get the stream ID.
    #[inline]
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Get the payload length.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.data.len()
    }

    /// Header describing this frame; `length` always equals the payload size.
    #[inline]
    pub fn header(&self) -> Header {
        Header::new(self.version, self.cmd, self.data.len() as u16, self.stream_id)
    }

    /// Serialize to exactly `HEADER_SIZE + data.len()` bytes, header first.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.data.len());
        buf.extend_from_slice(&self.header().encode());
        buf.extend_from_slice(&self.data);
        buf
    }
}
