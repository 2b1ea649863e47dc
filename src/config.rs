//! Session configuration.
//!
//! [`Config`] is a plain struct with defaults and a `validate()` check that
//! runs before a session is built. It is serde-enabled so host applications
//! can embed it in their own configuration files.
//!
//! # Example
//!
//! ```
//! use smux::Config;
//!
//! let config = Config {
//!     version: 2,
//!     max_frame_size: 16 * 1024,
//!     ..Config::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SmuxError};
use crate::protocol::{MAX_FRAME_PAYLOAD, PROTOCOL_V1, PROTOCOL_V2};

/// Default protocol version.
pub const DEFAULT_VERSION: u8 = PROTOCOL_V1;

/// Default keepalive ping interval.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Default keepalive timeout.
pub const DEFAULT_KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default maximum frame payload.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 32 * 1024;

/// Default session-wide receive buffer (token bucket capacity).
pub const DEFAULT_MAX_RECEIVE_BUFFER: usize = 4 * 1024 * 1024;

/// Default per-stream receive buffer (v2 window).
pub const DEFAULT_MAX_STREAM_BUFFER: usize = 64 * 1024;

/// Configuration for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Protocol version, 1 or 2. Both peers must agree.
    pub version: u8,
    /// Disable NOP pings and the liveness timeout.
    pub keep_alive_disabled: bool,
    /// How often a NOP frame is sent.
    pub keep_alive_interval: Duration,
    /// Session is closed if nothing arrives for this long (must exceed the interval).
    pub keep_alive_timeout: Duration,
    /// Largest payload per frame, `1..=65535`.
    pub max_frame_size: usize,
    /// Bytes buffered across all streams before the receive loop pauses.
    pub max_receive_buffer: usize,
    /// Per-stream window advertised to the peer (v2).
    pub max_stream_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: DEFAULT_VERSION,
            keep_alive_disabled: false,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            keep_alive_timeout: DEFAULT_KEEP_ALIVE_TIMEOUT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_receive_buffer: DEFAULT_MAX_RECEIVE_BUFFER,
            max_stream_buffer: DEFAULT_MAX_STREAM_BUFFER,
        }
    }
}

impl Config {
    /// Check every field and report the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.version != PROTOCOL_V1 && self.version != PROTOCOL_V2 {
            return Err(invalid(format!(
                "unsupported protocol version {}",
                self.version
            )));
        }

        if !self.keep_alive_disabled {
            if self.keep_alive_interval.is_zero() {
                return Err(invalid("keep-alive interval must be positive"));
            }
            if self.keep_alive_timeout <= self.keep_alive_interval {
                return Err(invalid(
                    "keep-alive timeout must be larger than keep-alive interval",
                ));
            }
        }

        if self.max_frame_size == 0 {
            return Err(invalid("max frame size must be positive"));
        }
        if self.max_frame_size > MAX_FRAME_PAYLOAD {
            return Err(invalid(format!(
                "max frame size must not be larger than {}",
                MAX_FRAME_PAYLOAD
            )));
        }

        if self.max_receive_buffer == 0 {
            return Err(invalid("max receive buffer must be positive"));
        }

        if self.max_stream_buffer == 0 {
            return Err(invalid("max stream buffer must be positive"));
        }
        if self.max_stream_buffer > self.max_receive_buffer {
            return Err(invalid(
                "max stream buffer must not be larger than max receive buffer",
            ));
        }
        if self.max_stream_buffer > i32::MAX as usize {
            return Err(invalid(format!(
                "max stream buffer cannot be larger than {}",
                i32::MAX
            )));
        }

        Ok(())
    }

    /// Check if protocol v2 flow control is enabled.
    #[inline]
    pub fn flow_control(&self) -> bool {
        self.version >= PROTOCOL_V2
    }
}

fn invalid(msg: impl Into<String>) -> SmuxError {
    SmuxError::Config(msg.into())
}
