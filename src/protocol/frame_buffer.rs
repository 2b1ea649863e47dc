//! Frame buffer for accumulating partial reads.
//!
//! The session's receive loop reads frames straight off the transport with
//! exact-length reads, because it must stop pulling bytes as soon as the
//! token bucket runs dry. `FrameBuffer` is the sans-IO counterpart: feed it
//! arbitrary slices of a captured byte stream and it hands back complete
//! frames. Useful for taps, diagnostics and protocol tests.
//!
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForHeader`: Need at least 8 bytes
//! - `WaitingForPayload`: Header parsed, need N more payload bytes
//!
//! # Example
//!
//! ```
//! use smux::protocol::{Cmd, Frame, FrameBuffer};
//!
//! let wire = Frame::new(1, Cmd::Syn, 1).encode();
//! let mut buffer = FrameBuffer::new(1);
//! let frames = buffer.push(&wire).unwrap();
//! assert_eq!(frames[0].cmd, Cmd::Syn);
//! ```

use bytes::BytesMut;

use super::wire_format::{Header, HEADER_SIZE};
use super::Frame;
use crate::error::Result;

/// State machine for frame parsing.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for complete header (need 8 bytes).
    WaitingForHeader,
    /// Header parsed, waiting for payload bytes.
    WaitingForPayload { header: Header, remaining: usize },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    /// Accumulated bytes.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Expected protocol version.
    version: u8,
}

impl FrameBuffer {
    /// Create a new frame buffer expecting the given protocol version.
    pub fn new(version: u8) -> Self {
        Self::with_capacity(version, 64 * 1024)
    }

    /// Create a new frame buffer with custom initial capacity.
    pub fn with_capacity(version: u8, capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            state: State::WaitingForHeader,
            version,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// If data is fragmented, partial data is buffered internally for the
    /// next push.
    ///
    /// # Errors
    ///
    /// Returns a protocol error on version mismatch, unknown command or a
    /// malformed window update. The buffer should be discarded afterwards.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }

        Ok(frames)
    }

    fn try_extract_one(&mut self) -> Result<Option<Frame>> {
        match &self.state {
            State::WaitingForHeader => {
                let header = match Header::decode(&self.buffer) {
                    Some(header) => header,
                    None => return Ok(None),
                };
                let cmd = header.validate(self.version)?;

                let _ = self.buffer.split_to(HEADER_SIZE);

                if header.length == 0 {
                    return Ok(Some(Frame::new(header.version, cmd, header.stream_id)));
                }

                self.state = State::WaitingForPayload {
                    header,
                    remaining: header.length as usize,
                };

                self.try_extract_one()
            }

            State::WaitingForPayload { header, remaining } => {
                let remaining = *remaining;

                if self.buffer.len() < remaining {
                    return Ok(None);
                }

                let payload = self.buffer.split_to(remaining).freeze();
                let header = *header;
                self.state = State::WaitingForHeader;

                let cmd = header.command()?;
                Ok(Some(Frame::with_data(
                    header.version,
                    cmd,
                    header.stream_id,
                    payload,
                )))
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForHeader;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForPayload { .. } => "WaitingForPayload",
        }
    }
}
