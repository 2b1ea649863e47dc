//! Session-wide receive backpressure.
//!
//! The [`TokenBucket`] counts how many more bytes the receive loop may pull
//! off the transport and park in stream buffers, summed over all streams.
//! The receive loop debits it for every payload it queues; readers credit it
//! back for exactly the bytes they copy out (or the session credits a whole
//! stream's leftovers when that stream closes).
//!
//! While the bucket is at or below zero the receive loop stops reading the
//! transport altogether, which pushes the pressure back onto the peer.
//!
//! # Configuration
//!
//! - Capacity: `Config::max_receive_buffer` (default: 4 MiB)

use std::sync::atomic::{AtomicI64, Ordering};

use tokio::sync::Notify;

/// Signed byte counter shared by the receive loop and all readers.
///
/// Updates are atomic and followed by a best-effort wake of the receive
/// loop; the notifier never blocks.
#[derive(Debug)]
pub struct TokenBucket {
    /// Bytes the receive loop may still admit. May go negative by at most
    /// one frame.
    tokens: AtomicI64,
    /// Wakes the receive loop when tokens become available.
    notify: Notify,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(i64::MAX as usize) as i64;
        Self {
            tokens: AtomicI64::new(capacity),
            notify: Notify::new(),
        }
    }

    /// Current token count.
    #[inline]
    pub fn available(&self) -> i64 {
        self.tokens.load(Ordering::Acquire)
    }

    /// Check if the receive loop may read another frame.
    #[inline]
    pub fn has_tokens(&self) -> bool {
        self.available() > 0
    }

    /// Debit admitted bytes (receive loop only).
    #[inline]
    pub fn consume(&self, n: usize) {
        self.tokens.fetch_sub(n as i64, Ordering::AcqRel);
    }

    /// Credit bytes consumed by the application or reclaimed from a stream.
    pub fn release(&self, n: usize) {
        if n == 0 {
            return;
        }
        let after = self.tokens.fetch_add(n as i64, Ordering::AcqRel) + n as i64;
        if after > 0 {
            self.notify.notify_one();
        }
    }

    /// Wake the receive loop so it re-checks the bucket and session state.
    #[inline]
    pub fn nudge(&self) {
        self.notify.notify_one();
    }

    /// Wait until the bucket has tokens or someone nudges it.
    ///
    /// A wake that raced ahead of this call is not lost: `notify_one` stores
    /// a permit when nobody is waiting.
    pub async fn notified(&self) {
        self.notify.notified().await
    }
}
