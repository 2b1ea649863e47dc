//! Send loop: the only task that writes the transport.
//!
//! Streams and the session never touch the write half directly. They build a
//! [`WriteRequest`] (pre-encoded header plus payload), push it into the
//! [`Shaper`], and await the one-shot result. The send loop pops requests in
//! fair order and writes them in batches.
//!
//! # Architecture
//!
//! ```text
//! Stream 1 ─┐
//! Stream 2 ─┼─► Shaper (round-robin) ─► Send Loop ─► Transport
//! Session  ─┘         ▲                     │
//!                     └──── per-request ◄───┘
//!                           oneshot result
//! ```
//!
//! # Batching
//!
//! After the first request is available, up to [`MAX_BATCH_SIZE`] more ready
//! requests are collected without waiting. The batch goes out with a single
//! `write_vectored` when the transport supports it, otherwise it is copied
//! into one scratch buffer first.
//!
//! # Cancellation
//!
//! Every request carries a [`Ticket`]. The send loop claims a ticket right
//! before writing; a caller whose deadline expired first cancels it instead,
//! and the request is skipped without touching the wire.

use std::future::Future;
use std::io::IoSlice;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;

use crate::error::{Result, SmuxError};
use crate::protocol::{Header, HEADER_SIZE};
use crate::shaper::Shaper;

/// Maximum requests to batch in a single write operation.
pub const MAX_BATCH_SIZE: usize = 64;

/// Scheduling class. Lower classes leave first within one stream's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Class {
    /// SYN, NOP and UPD.
    Ctrl = 0,
    /// PSH and FIN (FIN stays behind queued data).
    Data = 1,
}

const PENDING: u8 = 0;
const CLAIMED: u8 = 1;
const CANCELLED: u8 = 2;

/// Claim-or-cancel state shared by a request and its submitter.
#[derive(Debug, Default)]
pub struct Ticket(AtomicU8);

impl Ticket {
    /// Send loop side: take the request for writing.
    #[inline]
    pub fn claim(&self) -> bool {
        self.0
            .compare_exchange(PENDING, CLAIMED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Submitter side: withdraw the request before it is written.
    ///
    /// Returns `false` if the send loop already owns it.
    #[inline]
    pub fn cancel(&self) -> bool {
        self.0
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        self.0.load(Ordering::Acquire) == PENDING
    }
}

/// A frame queued for the send loop.
#[derive(Debug)]
pub struct WriteRequest {
    /// Scheduling class.
    pub class: Class,
    /// Session-wide submission sequence (wrapping).
    pub seq: u32,
    /// Stream the frame belongs to; selects the shaper queue.
    pub stream_id: u32,
    /// Pre-encoded header.
    pub header: [u8; HEADER_SIZE],
    /// Payload bytes (empty for SYN, FIN and NOP).
    pub payload: Bytes,
    ticket: Arc<Ticket>,
    result: oneshot::Sender<Result<usize>>,
}

impl WriteRequest {
    /// Create a request and the handle its submitter waits on.
    pub fn new(class: Class, seq: u32, header: &Header, payload: Bytes) -> (Self, Pending) {
        debug_assert_eq!(header.length as usize, payload.len());
        let ticket = Arc::new(Ticket::default());
        let (tx, rx) = oneshot::channel();
        let len = payload.len();
        let request = Self {
            class,
            seq,
            stream_id: header.stream_id,
            header: header.encode(),
            payload,
            ticket: ticket.clone(),
            result: tx,
        };
        (request, Pending { ticket, rx, len })
    }

    /// Total size of this frame on the wire.
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    fn claim(&self) -> bool {
        self.ticket.claim()
    }

    /// Report the outcome to the submitter. A submitter that stopped
    /// listening is ignored.
    fn complete(self, result: Result<usize>) {
        let _ = self.result.send(result);
    }
}

/// Submitter's view of a queued request.
#[derive(Debug)]
pub struct Pending {
    ticket: Arc<Ticket>,
    rx: oneshot::Receiver<Result<usize>>,
    len: usize,
}

impl Pending {
    /// Payload bytes carried by the request.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Try to withdraw the request. `true` means it will never be written.
    #[inline]
    pub fn cancel(&self) -> bool {
        self.ticket.cancel()
    }

    /// Check if the send loop has not picked the request up yet.
    #[inline]
    pub fn is_pending(&self) -> bool {
        self.ticket.is_pending()
    }

    /// Wait for the send loop's verdict.
    ///
    /// A request dropped unwritten (session shut down) reports `BrokenPipe`.
    pub async fn result(&mut self) -> Result<usize> {
        match (&mut self.rx).await {
            Ok(result) => result,
            Err(_) => Err(SmuxError::BrokenPipe),
        }
    }
}

/// Pop requests from the shaper and write them until `shutdown` resolves or
/// the transport fails.
///
/// On a write error every request of the failed batch is answered with
/// `SocketWrite` and the same error is returned. Requests still queued when
/// the loop exits are dropped, which their submitters observe as
/// `BrokenPipe`.
pub async fn send_loop<W, F>(mut writer: W, shaper: &Shaper, shutdown: F) -> Result<()>
where
    W: AsyncWrite + Unpin,
    F: Future,
{
    tokio::pin!(shutdown);
    let vectored = writer.is_write_vectored();
    let mut scratch = Vec::new();

    let outcome = loop {
        let first = tokio::select! {
            biased;
            _ = &mut shutdown => break Ok(()),
            req = shaper.pop() => req,
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        if first.claim() {
            batch.push(first);
        }
        while batch.len() < MAX_BATCH_SIZE {
            match shaper.try_pop() {
                Some(req) if req.claim() => batch.push(req),
                Some(_) => {}
                None => break,
            }
        }
        if batch.is_empty() {
            continue;
        }

        let written = tokio::select! {
            biased;
            _ = &mut shutdown => break Ok(()),
            r = write_batch(&mut writer, &batch, vectored, &mut scratch) => r,
        };

        match written {
            Ok(()) => {
                for req in batch {
                    let n = req.payload.len();
                    req.complete(Ok(n));
                }
            }
            Err(e) => {
                tracing::error!("transport write failed: {}", e);
                let err = SmuxError::SocketWrite(Arc::new(e));
                for req in batch {
                    req.complete(Err(err.clone()));
                }
                break Err(err);
            }
        }
    };

    let dropped = shaper.drain().len();
    tracing::debug!(dropped, "send loop stopped");
    let _ = writer.shutdown().await;
    outcome
}

/// Write a batch of frames, vectored when the transport supports it.
async fn write_batch<W>(
    writer: &mut W,
    batch: &[WriteRequest],
    vectored: bool,
    scratch: &mut Vec<u8>,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    if !vectored {
        scratch.clear();
        for req in batch {
            scratch.extend_from_slice(&req.header);
            scratch.extend_from_slice(&req.payload);
        }
        writer.write_all(&scratch[..]).await?;
        return writer.flush().await;
    }

    let total_size: usize = batch.iter().map(|r| r.size()).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        if slices.is_empty() {
            break;
        }

        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            ));
        }
        total_written += written;
    }

    writer.flush().await
}

/// Build IoSlice array for the data not yet written.
fn build_remaining_slices(batch: &[WriteRequest], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut offset = 0;

    for req in batch {
        let header_end = offset + HEADER_SIZE;
        if skip_bytes < header_end {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&req.header[start..]));
        }
        offset = header_end;

        if !req.payload.is_empty() {
            let payload_end = offset + req.payload.len();
            if skip_bytes < payload_end {
                let start = skip_bytes.saturating_sub(offset);
                slices.push(IoSlice::new(&req.payload[start..]));
            }
            offset = payload_end;
        }
    }

    slices
}
