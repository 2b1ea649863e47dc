//! Pooled buffer allocator for inbound frame payloads.
//!
//! Hands out byte buffers whose capacity is a power of two between 1 and
//! 65536, reused across frames to avoid per-frame heap churn.
//!
//! # Design
//!
//! - 17 size classes (`2^0 ..= 2^16`), each a free list behind its own lock
//! - The class for a request is found from the most significant bit of
//!   `size - 1`, so lookup is O(1)
//! - Worst-case waste per buffer is below 50% of its capacity
//!
//! # Note
//!
//! Buffers are NOT zeroed on reuse. A buffer returned by [`Allocator::get`]
//! may contain bytes from a previous frame; callers must overwrite the whole
//! length before exposing it.
//!
//! # Usage
//!
//! ```
//! use smux::Allocator;
//!
//! let alloc = Allocator::new();
//! let buf = alloc.get(100).unwrap();
//! assert_eq!(buf.len(), 100);
//! assert_eq!(buf.capacity(), 128);
//! alloc.put(buf).unwrap();
//! ```

use std::sync::{Arc, Mutex, OnceLock};

use crate::error::{Result, SmuxError};

/// Number of size classes (1 byte up to 64 KiB).
pub const SIZE_CLASSES: usize = 17;

/// Largest buffer the allocator hands out.
pub const MAX_BUFFER_SIZE: usize = 1 << (SIZE_CLASSES - 1);

/// Maximum number of idle buffers kept per size class.
const MAX_IDLE_PER_CLASS: usize = 1024;

/// Size-class buffer pool.
///
/// Each session owns an `Arc<Allocator>`; [`Allocator::shared`] is only a
/// convenience default for callers that don't care.
pub struct Allocator {
    /// Free lists, indexed by size class.
    pools: [Mutex<Vec<Vec<u8>>>; SIZE_CLASSES],
}

impl Allocator {
    /// Create an empty allocator.
    pub fn new() -> Self {
        Self {
            pools: std::array::from_fn(|_| Mutex::new(Vec::new())),
        }
    }

    /// Process-wide default allocator.
    pub fn shared() -> Arc<Allocator> {
        static SHARED: OnceLock<Arc<Allocator>> = OnceLock::new();
        SHARED.get_or_init(|| Arc::new(Allocator::new())).clone()
    }

    /// Get a buffer of length `size` from the smallest fitting size class.
    ///
    /// Returns `None` if `size` is 0 or larger than 65536.
    pub fn get(&self, size: usize) -> Option<Vec<u8>> {
        if size == 0 || size > MAX_BUFFER_SIZE {
            return None;
        }

        let class = size_class(size);
        let pooled = self.pools[class]
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop();

        let mut buf = pooled.unwrap_or_else(|| Vec::with_capacity(1 << class));
        // Stale contents are kept; only the tail beyond the previous length
        // is initialised.
        buf.resize(size, 0);
        Some(buf)
    }

    /// Return a buffer to its size class.
    ///
    /// # Errors
    ///
    /// Returns `SmuxError::Alloc` if the capacity is not an exact power of
    /// two in `1..=65536`, i.e. the buffer did not come from [`get`](Self::get).
    pub fn put(&self, buf: Vec<u8>) -> Result<()> {
        let cap = buf.capacity();
        if cap == 0 || cap > MAX_BUFFER_SIZE || !cap.is_power_of_two() {
            return Err(SmuxError::Alloc(format!(
                "buffer capacity {} is not a pooled size class",
                cap
            )));
        }

        let class = cap.trailing_zeros() as usize;
        let mut pool = self.pools[class].lock().unwrap_or_else(|e| e.into_inner());
        if pool.len() < MAX_IDLE_PER_CLASS {
            pool.push(buf);
        }
        Ok(())
    }

    /// Number of idle buffers currently held for the class serving `size`.
    pub fn idle(&self, size: usize) -> usize {
        if size == 0 || size > MAX_BUFFER_SIZE {
            return 0;
        }
        self.pools[size_class(size)]
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Index of the smallest power-of-two class holding `size` bytes.
///
/// `size` must be in `1..=MAX_BUFFER_SIZE`.
#[inline]
fn size_class(size: usize) -> usize {
    (usize::BITS - (size - 1).leading_zeros()) as usize
}
