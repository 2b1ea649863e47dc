//! Wire format encoding and decoding.
//!
//! Implements the 8-byte frame header:
//! ```text
//! ┌─────────┬───────┬──────────┬───────────┐
//! │ Version │ Cmd   │ Length   │ Stream ID │
//! │ 1 byte  │ 1 byte│ uint16 LE│ uint32 LE │
//! └─────────┴───────┴──────────┴───────────┘
//! ```
//!
//! All multi-byte integers are Little Endian. `UPD` frames (protocol v2)
//! carry an 8-byte payload of `consumed` and `window`, both uint32 LE.

use crate::error::{Result, SmuxError};

/// Header size in bytes (fixed, exactly 8).
pub const HEADER_SIZE: usize = 8;

/// Size of the `UPD` payload (consumed + window).
pub const UPD_SIZE: usize = 8;

/// Largest payload a single frame can describe (uint16 length).
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Protocol version 1: SYN/FIN/PSH/NOP only.
pub const PROTOCOL_V1: u8 = 1;

/// Protocol version 2: adds UPD and per-stream sliding windows.
pub const PROTOCOL_V2: u8 = 2;

/// Frame command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cmd {
    /// Stream open.
    Syn = 0,
    /// Stream close (EOF).
    Fin = 1,
    /// Data push.
    Psh = 2,
    /// Keepalive, carries nothing.
    Nop = 3,
    /// Window update (v2 only).
    Upd = 4,
}

impl Cmd {
    /// Check if this command is legal under the given protocol version.
    #[inline]
    pub fn allowed_in(self, version: u8) -> bool {
        self != Cmd::Upd || version >= PROTOCOL_V2
    }
}

impl TryFrom<u8> for Cmd {
    type Error = SmuxError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Cmd::Syn),
            1 => Ok(Cmd::Fin),
            2 => Ok(Cmd::Psh),
            3 => Ok(Cmd::Nop),
            4 => Ok(Cmd::Upd),
            other => Err(SmuxError::Protocol(format!("unknown command {}", other))),
        }
    }
}

impl From<Cmd> for u8 {
    #[inline]
    fn from(cmd: Cmd) -> u8 {
        cmd as u8
    }
}

/// Decoded header from wire format.
///
/// The command is kept as the raw byte so that an unknown command can be
/// reported by the receive loop instead of being lost during decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Protocol version (1 or 2).
    pub version: u8,
    /// Raw command byte (see [`Cmd`]).
    pub cmd: u8,
    /// Payload length in bytes.
    pub length: u16,
    /// Stream identifier.
    pub stream_id: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(version: u8, cmd: Cmd, length: u16, stream_id: u32) -> Self {
        Self {
            version,
            cmd: cmd.into(),
            length,
            stream_id,
        }
    }

    /// Encode header to bytes (Little Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use smux::protocol::{Cmd, Header};
    ///
    /// let header = Header::new(1, Cmd::Psh, 4, 3);
    /// let bytes = header.encode();
    /// assert_eq!(bytes, [1, 2, 4, 0, 3, 0, 0, 0]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.version;
        buf[1] = self.cmd;
        buf[2..4].copy_from_slice(&self.length.to_le_bytes());
        buf[4..8].copy_from_slice(&self.stream_id.to_le_bytes());
        buf
    }

    /// Decode a header from exactly eight bytes. Pure field extraction.
    #[inline]
    pub fn from_bytes(buf: &[u8; HEADER_SIZE]) -> Self {
        Self {
            version: buf[0],
            cmd: buf[1],
            length: u16::from_le_bytes([buf[2], buf[3]]),
            stream_id: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }

    /// Decode header from bytes (Little Endian).
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let head: &[u8; HEADER_SIZE] = buf.get(..HEADER_SIZE)?.try_into().ok()?;
        Some(Self::from_bytes(head))
    }

    /// Typed command, or a protocol error for an unknown command byte.
    #[inline]
    pub fn command(&self) -> Result<Cmd> {
        Cmd::try_from(self.cmd)
    }

    /// Validate the header against the locally configured protocol version.
    ///
    /// Checks:
    /// - Version matches exactly (no negotiation)
    /// - Command is known and legal for the version
    /// - `UPD` frames carry exactly `UPD_SIZE` bytes
    pub fn validate(&self, version: u8) -> Result<Cmd> {
        if self.version != version {
            return Err(SmuxError::Protocol(format!(
                "version mismatch: got {}, expected {}",
                self.version, version
            )));
        }

        let cmd = self.command()?;
        if !cmd.allowed_in(version) {
            return Err(SmuxError::Protocol(format!(
                "command {:?} not allowed in version {}",
                cmd, version
            )));
        }

        if cmd == Cmd::Upd && self.length as usize != UPD_SIZE {
            return Err(SmuxError::Protocol(format!(
                "window update carries {} bytes, expected {}",
                self.length, UPD_SIZE
            )));
        }

        Ok(cmd)
    }
}

/// Payload of a `UPD` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUpdate {
    /// Cumulative bytes consumed by the receiver.
    pub consumed: u32,
    /// Receiver's current buffer capacity.
    pub window: u32,
}

impl WindowUpdate {
    /// Encode to the 8-byte wire payload.
    pub fn encode(&self) -> [u8; UPD_SIZE] {
        let mut buf = [0u8; UPD_SIZE];
        buf[0..4].copy_from_slice(&self.consumed.to_le_bytes());
        buf[4..8].copy_from_slice(&self.window.to_le_bytes());
        buf
    }

    /// Decode from the 8-byte wire payload.
    pub fn decode(buf: &[u8; UPD_SIZE]) -> Self {
        Self {
            consumed: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            window: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }
}
