//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the binary protocol shared by both peers:
//! - 8-byte header encoding/decoding
//! - Frame struct with the v2 window update payload
//! - Frame buffer for extracting frames from captured bytes

mod frame;
mod frame_buffer;
mod wire_format;

pub use frame::Frame;
pub use frame_buffer::FrameBuffer;
pub use wire_format::{
    Cmd, Header, WindowUpdate, HEADER_SIZE, MAX_FRAME_PAYLOAD, PROTOCOL_V1, PROTOCOL_V2,
    UPD_SIZE,
};
