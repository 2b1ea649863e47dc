//! Fair write scheduler.
//!
//! Every stream gets its own queue, a min-heap ordered by `(class, seq)`, so
//! control frames of a stream overtake its queued data while same-class
//! frames keep their submission order. A ring of stream ids is walked
//! round-robin: each turn hands out at most one frame, and the cursor only
//! skips queues that are empty. A stream with a deep backlog therefore
//! cannot starve the others.
//!
//! Queues that stay empty for longer than [`QUEUE_EXPIRY`] are dropped from
//! the ring the next time the cursor passes them.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::writer::WriteRequest;

/// How long an empty per-stream queue is kept before it is reclaimed.
pub const QUEUE_EXPIRY: Duration = Duration::from_secs(60);

/// Heap entry; the smallest `(class, seq)` pops first.
#[derive(Debug)]
struct Queued(WriteRequest);

/// Compare submission sequences with wrap-around.
#[inline]
fn seq_cmp(a: u32, b: u32) -> Ordering {
    (a.wrapping_sub(b) as i32).cmp(&0)
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // Reversed: BinaryHeap is a max-heap.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .0
            .class
            .cmp(&self.0.class)
            .then_with(|| seq_cmp(other.0.seq, self.0.seq))
    }
}

#[derive(Debug)]
struct StreamQueue {
    heap: BinaryHeap<Queued>,
    last_active: Instant,
}

/// Round-robin state. Pure and synchronous; [`Shaper`] wraps it.
#[derive(Debug, Default)]
struct Rotation {
    queues: HashMap<u32, StreamQueue>,
    ring: VecDeque<u32>,
    len: usize,
}

impl Rotation {
    fn push(&mut self, req: WriteRequest, now: Instant) {
        let id = req.stream_id;
        let ring = &mut self.ring;
        let queue = self.queues.entry(id).or_insert_with(|| {
            ring.push_back(id);
            StreamQueue {
                heap: BinaryHeap::new(),
                last_active: now,
            }
        });
        queue.heap.push(Queued(req));
        queue.last_active = now;
        self.len += 1;
    }

    fn pop(&mut self, now: Instant) -> Option<WriteRequest> {
        for _ in 0..self.ring.len() {
            let id = self.ring.pop_front()?;
            let Some(queue) = self.queues.get_mut(&id) else {
                continue;
            };

            if let Some(Queued(req)) = queue.heap.pop() {
                queue.last_active = now;
                self.ring.push_back(id);
                self.len -= 1;
                return Some(req);
            }

            if now.saturating_duration_since(queue.last_active) >= QUEUE_EXPIRY {
                self.queues.remove(&id);
            } else {
                self.ring.push_back(id);
            }
        }
        None
    }

    fn drain(&mut self) -> Vec<WriteRequest> {
        self.ring.clear();
        self.len = 0;
        self.queues
            .drain()
            .flat_map(|(_, q)| q.heap.into_vec())
            .map(|Queued(req)| req)
            .collect()
    }
}

/// Thread-safe shaper shared by all submitters and the send loop.
#[derive(Debug, Default)]
pub struct Shaper {
    rotation: Mutex<Rotation>,
    ready: Notify,
}

impl Shaper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a request and wake the send loop.
    pub fn push(&self, req: WriteRequest) {
        self.lock().push(req, Instant::now());
        self.ready.notify_one();
    }

    /// Next request in fair order, if any.
    pub fn try_pop(&self) -> Option<WriteRequest> {
        self.lock().pop(Instant::now())
    }

    /// Wait for the next request.
    pub async fn pop(&self) -> WriteRequest {
        loop {
            if let Some(req) = self.try_pop() {
                return req;
            }
            self.ready.notified().await;
        }
    }

    /// Remove every queued request.
    pub fn drain(&self) -> Vec<WriteRequest> {
        self.lock().drain()
    }

    /// Number of queued requests.
    pub fn len(&self) -> usize {
        self.lock().len
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Rotation> {
        self.rotation.lock().unwrap_or_else(|e| e.into_inner())
    }
}
