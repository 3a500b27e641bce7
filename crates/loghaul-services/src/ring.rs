//! Bounded ring buffer between producers and worker pools.
//!
//! Slots are pre-allocated and addressed by `sequence mod capacity` (a mask
//! when the capacity is a power of two). Producers claim and publish under
//! one claim lock, so the published cursor always advances by whole
//! batches. Each consumer owns a gating `Sequence`: the next sequence it
//! has not yet finished with. A slot is only reused once every gating
//! sequence has moved past it, which gives
//! `published - slowest consumer <= capacity` at all times.
//!
//! # Waiting
//!
//! Producers blocked for space park on a condvar tied to the claim lock.
//! Consumers blocked for data park on a second condvar. Both sides count
//! their parked waiters, and the opposite side only takes the lock to
//! notify when that count is non-zero. Parks use a short timeout so a
//! missed notification costs at most one timeout.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};

use loghaul_core::config::InsertPolicy;

use crate::metrics::BufferSnapshot;

/// Upper bound on a single park before re-checking state.
const PARK_TIMEOUT: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    #[error("out of capacity: {requested} slots requested, {available} free")]
    OutOfCapacity { requested: usize, available: usize },

    #[error("batch of {batch} events can never fit in capacity {capacity}")]
    BatchTooLarge { batch: usize, capacity: usize },

    #[error("buffer closed")]
    Closed,

    #[error("buffer capacity must be at least 1")]
    InvalidCapacity,
}

/// A batch the buffer did not accept, returned untouched.
#[derive(Debug)]
pub struct Refused<T> {
    pub error: BufferError,
    pub events: Vec<T>,
}

/// A consumer's read position. Everything below it has been consumed.
#[derive(Debug)]
pub struct Sequence(AtomicU64);

impl Sequence {
    fn new(value: u64) -> Self {
        Self(AtomicU64::new(value))
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct RingBuffer<T> {
    slots: Box<[Mutex<Option<T>>]>,
    capacity: usize,
    mask: Option<u64>,
    policy: InsertPolicy,

    /// Next sequence to hand out. Equal to `published` whenever unlocked.
    claim: Mutex<u64>,
    published: AtomicU64,
    space: Condvar,
    parked_producers: AtomicUsize,

    gating: RwLock<Vec<Arc<Sequence>>>,
    /// Gating floor once every consumer has been removed.
    floor: AtomicU64,

    data_lock: Mutex<()>,
    data: Condvar,
    parked_consumers: AtomicUsize,

    closed: AtomicBool,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize, policy: InsertPolicy) -> Result<Self, BufferError> {
        if capacity == 0 {
            return Err(BufferError::InvalidCapacity);
        }
        let slots = (0..capacity).map(|_| Mutex::new(None)).collect();
        let mask = capacity.is_power_of_two().then(|| capacity as u64 - 1);

        Ok(Self {
            slots,
            capacity,
            mask,
            policy,
            claim: Mutex::new(0),
            published: AtomicU64::new(0),
            space: Condvar::new(),
            parked_producers: AtomicUsize::new(0),
            gating: RwLock::new(Vec::new()),
            floor: AtomicU64::new(0),
            data_lock: Mutex::new(()),
            data: Condvar::new(),
            parked_consumers: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> InsertPolicy {
        self.policy
    }

    #[inline]
    fn index(&self, sequence: u64) -> usize {
        match self.mask {
            Some(mask) => (sequence & mask) as usize,
            None => (sequence % self.capacity as u64) as usize,
        }
    }

    // ── Insertion ─────────────────────────────────────────────────────────────

    /// Insert one event using the configured policy.
    pub fn insert(&self, event: T) -> Result<u64, BufferError> {
        self.insert_batch(vec![event]).map(|range| range.start)
    }

    /// Insert a batch atomically using the configured policy.
    pub fn insert_batch(&self, events: Vec<T>) -> Result<Range<u64>, BufferError> {
        self.offer_batch(events).map_err(|refused| refused.error)
    }

    /// Like [`insert_batch`](Self::insert_batch), but a refused batch is
    /// handed back to the caller instead of dropped.
    pub fn offer_batch(&self, events: Vec<T>) -> Result<Range<u64>, Refused<T>> {
        match self.policy {
            InsertPolicy::Cached => self.offer_cached(events),
            InsertPolicy::FailFast => self.offer_fail_fast(events),
        }
    }

    /// Insert one event, blocking while the buffer is full.
    pub fn insert_cached(&self, event: T) -> Result<u64, BufferError> {
        self.insert_cached_batch(vec![event]).map(|range| range.start)
    }

    /// Insert a batch into contiguous sequences, blocking until all of it
    /// fits. A batch larger than the whole buffer fails with
    /// `BatchTooLarge` instead of blocking forever.
    pub fn insert_cached_batch(&self, events: Vec<T>) -> Result<Range<u64>, BufferError> {
        self.offer_cached(events).map_err(|refused| refused.error)
    }

    fn offer_cached(&self, events: Vec<T>) -> Result<Range<u64>, Refused<T>> {
        let n = events.len();
        if n > self.capacity {
            let error = BufferError::BatchTooLarge {
                batch: n,
                capacity: self.capacity,
            };
            return Err(Refused { error, events });
        }

        let mut next = self.claim.lock();
        loop {
            if self.is_closed() {
                return Err(Refused {
                    error: BufferError::Closed,
                    events,
                });
            }
            if self.free_after(*next) >= n {
                break;
            }
            self.parked_producers.fetch_add(1, Ordering::SeqCst);
            if self.free_after(*next) < n && !self.is_closed() {
                self.space.wait_for(&mut next, PARK_TIMEOUT);
            }
            self.parked_producers.fetch_sub(1, Ordering::SeqCst);
        }

        let range = self.publish_locked(&mut next, events);
        drop(next);
        self.wake_consumers();
        Ok(range)
    }

    /// Insert one event or fail immediately.
    pub fn insert_fail_fast(&self, event: T) -> Result<u64, BufferError> {
        self.insert_fail_fast_batch(vec![event]).map(|range| range.start)
    }

    /// Insert a batch into contiguous sequences or fail immediately,
    /// leaving the buffer untouched.
    pub fn insert_fail_fast_batch(&self, events: Vec<T>) -> Result<Range<u64>, BufferError> {
        self.offer_fail_fast(events).map_err(|refused| refused.error)
    }

    fn offer_fail_fast(&self, events: Vec<T>) -> Result<Range<u64>, Refused<T>> {
        let n = events.len();
        if n > self.capacity {
            let error = BufferError::BatchTooLarge {
                batch: n,
                capacity: self.capacity,
            };
            return Err(Refused { error, events });
        }

        let mut next = self.claim.lock();
        if self.is_closed() {
            return Err(Refused {
                error: BufferError::Closed,
                events,
            });
        }
        let available = self.free_after(*next);
        if available < n {
            let error = BufferError::OutOfCapacity {
                requested: n,
                available,
            };
            return Err(Refused { error, events });
        }

        let range = self.publish_locked(&mut next, events);
        drop(next);
        self.wake_consumers();
        Ok(range)
    }

    /// Write `events` into the slots starting at `*next` and publish them in
    /// one cursor store. Caller holds the claim lock and has checked space.
    fn publish_locked(&self, next: &mut u64, events: Vec<T>) -> Range<u64> {
        let start = *next;
        let mut end = start;
        for event in events {
            *self.slots[self.index(end)].lock() = Some(event);
            end += 1;
        }
        self.published.store(end, Ordering::SeqCst);
        *next = end;
        start..end
    }

    fn wake_consumers(&self) {
        if self.parked_consumers.load(Ordering::SeqCst) > 0 {
            let _guard = self.data_lock.lock();
            self.data.notify_all();
        }
    }

    // ── Capacity ──────────────────────────────────────────────────────────────

    fn min_gating(&self) -> u64 {
        let gating = self.gating.read();
        gating
            .iter()
            .map(|s| s.get())
            .min()
            .unwrap_or_else(|| self.floor.load(Ordering::SeqCst))
    }

    fn free_after(&self, next: u64) -> usize {
        let used = next.saturating_sub(self.min_gating()) as usize;
        self.capacity.saturating_sub(used)
    }

    /// Whether `n` more events would fit right now.
    pub fn has_capacity(&self, n: usize) -> bool {
        self.remaining_capacity() >= n
    }

    /// Events published but not yet consumed by the slowest consumer.
    pub fn size(&self) -> usize {
        self.published().saturating_sub(self.min_gating()) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn remaining_capacity(&self) -> usize {
        self.capacity.saturating_sub(self.size())
    }

    /// Occupancy as a percentage of capacity.
    pub fn utilization(&self) -> f64 {
        self.size() as f64 * 100.0 / self.capacity as f64
    }

    pub fn snapshot(&self) -> BufferSnapshot {
        let size = self.size();
        BufferSnapshot {
            capacity: self.capacity,
            size,
            utilization_pct: size as f64 * 100.0 / self.capacity as f64,
        }
    }

    // ── Consumers ─────────────────────────────────────────────────────────────

    /// Number of events ever published. Sequences below it are readable.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    /// Register a consumer. It starts at the current gating floor, so it
    /// sees every event no other consumer has released yet.
    pub fn add_gating_sequence(&self) -> Arc<Sequence> {
        let mut gating = self.gating.write();
        let start = gating
            .iter()
            .map(|s| s.get())
            .min()
            .unwrap_or_else(|| self.floor.load(Ordering::SeqCst));
        let sequence = Arc::new(Sequence::new(start));
        gating.push(sequence.clone());
        sequence
    }

    pub fn remove_gating_sequence(&self, sequence: &Arc<Sequence>) {
        let mut gating = self.gating.write();
        gating.retain(|s| !Arc::ptr_eq(s, sequence));
        if gating.is_empty() {
            self.floor.fetch_max(sequence.get(), Ordering::SeqCst);
        }
        drop(gating);
        self.wake_producers();
    }

    /// Move a consumer forward, releasing slots below `to`.
    pub fn advance(&self, sequence: &Sequence, to: u64) {
        sequence.0.store(to, Ordering::SeqCst);
        self.wake_producers();
    }

    fn wake_producers(&self) {
        if self.parked_producers.load(Ordering::SeqCst) > 0 {
            let _guard = self.claim.lock();
            self.space.notify_all();
        }
    }

    /// Take the event at `sequence` out of its slot. Only the consumer that
    /// owns the sequence may call this, before advancing past it.
    pub(crate) fn take(&self, sequence: u64) -> Option<T> {
        self.slots[self.index(sequence)].lock().take()
    }

    /// Wait until something past `position` is published, the buffer is
    /// closed, or `timeout` elapses. Returns the published cursor.
    pub fn wait_for(&self, position: u64, timeout: Duration) -> u64 {
        let available = self.published();
        if available > position || self.is_closed() {
            return available;
        }

        let mut guard = self.data_lock.lock();
        self.parked_consumers.fetch_add(1, Ordering::SeqCst);
        if self.published() <= position && !self.is_closed() {
            self.data.wait_for(&mut guard, timeout);
        }
        self.parked_consumers.fetch_sub(1, Ordering::SeqCst);
        self.published()
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Refuse further inserts and wake every parked thread. Events already
    /// published stay readable.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        {
            let _guard = self.claim.lock();
            self.space.notify_all();
        }
        let _guard = self.data_lock.lock();
        self.data.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
