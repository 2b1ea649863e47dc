//! # smux
//!
//! Stream multiplexing over a single reliable, ordered connection.
//!
//! Many logical [`Stream`]s share one transport (TCP, a pipe, anything that
//! implements `AsyncRead + AsyncWrite`) with:
//!
//! - **Fair scheduling**: outbound frames are picked round-robin across
//!   streams, so one bulk writer cannot starve the rest
//! - **Bounded memory**: a session-wide token bucket stops reading the
//!   transport once too many received bytes are waiting to be read
//! - **Per-stream flow control** (protocol v2): writers never exceed the
//!   window the peer advertised with `UPD` frames
//!
//! ## Architecture
//!
//! - **Receive loop**: the only reader; parses frames and routes payloads
//! - **Send loop**: the only writer; drains the shaper in batches
//! - **Keepalive**: periodic `NOP` pings and a liveness timeout
//!
//! ## Example
//!
//! ```no_run
//! use smux::{Config, Session};
//! use tokio::io::duplex;
//!
//! #[tokio::main]
//! async fn main() -> smux::Result<()> {
//!     let (a, b) = duplex(64 * 1024);
//!     let client = Session::client(a, Config::default())?;
//!     let server = Session::server(b, Config::default())?;
//!
//!     let stream = client.open_stream().await?;
//!     stream.write_all(b"ping").await?;
//!
//!     let accepted = server.accept_stream().await?;
//!     let mut buf = [0u8; 4];
//!     let n = accepted.read(&mut buf).await?;
//!     assert_eq!(&buf[..n], b"ping");
//!     Ok(())
//! }
//! ```

pub mod alloc;
pub mod config;
pub mod error;
pub mod protocol;

mod backpressure;
mod session;
mod shaper;
mod signal;
mod stream;
mod writer;

pub use alloc::Allocator;
pub use config::Config;
pub use error::{Result, SmuxError};
pub use session::{Session, SessionBuilder, ACCEPT_BACKLOG};
pub use stream::{Stream, INITIAL_PEER_WINDOW, OPEN_CLOSE_TIMEOUT};
