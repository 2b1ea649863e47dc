//! One-shot broadcast signals and swappable deadlines.
//!
//! A [`Signal`] latches the first cause handed to [`Signal::fire`] and wakes
//! every task waiting in [`Signal::fired`]; later calls are no-ops. Sessions
//! use one per terminal condition (closed, socket read error, socket write
//! error, protocol error) and streams use one for local close.
//!
//! A [`Deadline`] holds an absolute instant that can be replaced while an
//! operation is waiting on it; the waiter re-arms on the new value.

use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use tokio::sync::Notify;

use crate::error::SmuxError;

/// Latch-and-broadcast primitive. The first cause wins.
#[derive(Debug, Default)]
pub struct Signal {
    cause: OnceLock<SmuxError>,
    notify: Notify,
}

impl Signal {
    /// Create an unfired signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal with `cause`.
    ///
    /// Returns `true` only for the call that actually fired it.
    pub fn fire(&self, cause: SmuxError) -> bool {
        let first = self.cause.set(cause).is_ok();
        if first {
            self.notify.notify_waiters();
        }
        first
    }

    /// Check if the signal has fired.
    #[inline]
    pub fn is_fired(&self) -> bool {
        self.cause.get().is_some()
    }

    /// The latched cause, if fired.
    #[inline]
    pub fn cause(&self) -> Option<SmuxError> {
        self.cause.get().cloned()
    }

    /// Wait until the signal fires and return the latched cause.
    pub async fn fired(&self) -> SmuxError {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent fire() can't slip
            // between the check and the await.
            notified.as_mut().enable();

            if let Some(cause) = self.cause.get() {
                return cause.clone();
            }
            notified.await;
        }
    }
}

/// Absolute deadline shared between a setter and blocked operations.
#[derive(Debug, Default)]
pub struct Deadline {
    at: Mutex<Option<Instant>>,
    changed: Notify,
}

impl Deadline {
    /// Create a disabled deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the deadline; `None` disables it. Wakes current waiters.
    pub fn set(&self, at: Option<Instant>) {
        *self.at.lock().unwrap_or_else(|e| e.into_inner()) = at;
        self.changed.notify_waiters();
    }

    /// Current deadline.
    #[inline]
    pub fn get(&self) -> Option<Instant> {
        *self.at.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Check if the deadline is set and already in the past.
    pub fn is_expired(&self) -> bool {
        matches!(self.get(), Some(at) if at <= Instant::now())
    }

    /// Resolve once the current deadline passes.
    ///
    /// Never resolves while the deadline is disabled. A deadline moved
    /// while waiting is picked up immediately.
    pub async fn expired(&self) {
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            match self.get() {
                None => changed.await,
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at.into()) => return,
                        _ = &mut changed => {}
                    }
                }
            }
        }
    }
}
