//! Chunk aggregator: turns fragments into complete payloads.
//!
//! Live sets sit in a sharded `DashMap` keyed by correlation id. All
//! mutation of one set happens through `entry()`, which holds that key's
//! shard lock, so two fragments of the same message never race while
//! fragments of different messages only contend when they hash to the same
//! shard. A completed set is removed under the same lock that completed it,
//! so the evictor can never observe it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use loghaul_core::config::ChunkConfig;
use loghaul_core::wire::{Chunk, CorrelationId};

use crate::metrics::{bump, AggregatorMetrics, AggregatorSnapshot};

/// Bounds on in-flight reassembly state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregatorLimits {
    /// Live incomplete sets allowed at once.
    pub max_sets: usize,
    /// Largest sequence count a message may declare.
    pub max_fragments: usize,
    /// Age since first fragment after which a set is stale.
    pub max_age: Duration,
}

impl Default for AggregatorLimits {
    fn default() -> Self {
        Self::from(&ChunkConfig::default())
    }
}

impl From<&ChunkConfig> for AggregatorLimits {
    fn from(config: &ChunkConfig) -> Self {
        Self {
            max_sets: config.max_sets,
            max_fragments: config.max_fragments,
            max_age: config.max_age(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AggregatorError {
    #[error("chunk capacity exceeded: {0}")]
    CapacityExceeded(CapacityLimit),

    #[error("chunk sequence index {index} out of range for count {count}")]
    SequenceOutOfRange { index: u8, count: u8 },
}

/// Which bound a rejected fragment ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CapacityLimit {
    #[error("{0} live chunk sets")]
    LiveSets(usize),
    #[error("sequence count {count} over limit of {max}")]
    Fragments { count: u8, max: usize },
}

/// Fragments received so far for one correlation id.
struct ChunkSet {
    sequence_count: u8,
    fragments: Vec<Option<Bytes>>,
    received: usize,
    first_arrival: Instant,
    last_arrival: Instant,
}

impl ChunkSet {
    fn new(sequence_count: u8, arrival: Instant) -> Self {
        Self {
            sequence_count,
            fragments: vec![None; sequence_count as usize],
            received: 0,
            first_arrival: arrival,
            last_arrival: arrival,
        }
    }

    /// Store a fragment. Returns true if the slot was already filled.
    fn insert(&mut self, index: u8, body: Bytes, arrival: Instant) -> bool {
        self.last_arrival = self.last_arrival.max(arrival);
        let slot = &mut self.fragments[index as usize];
        let duplicate = slot.is_some();
        if !duplicate {
            self.received += 1;
        }
        *slot = Some(body);
        duplicate
    }

    fn is_complete(&self) -> bool {
        self.received == self.sequence_count as usize
    }

    fn is_stale(&self, now: Instant, max_age: Duration) -> bool {
        now.saturating_duration_since(self.first_arrival) > max_age
    }

    fn reassemble(self) -> Bytes {
        let total = self.fragments.iter().flatten().map(Bytes::len).sum();
        let mut out = BytesMut::with_capacity(total);
        for body in self.fragments.into_iter().flatten() {
            out.extend_from_slice(&body);
        }
        out.freeze()
    }
}

pub struct ChunkAggregator {
    sets: DashMap<CorrelationId, ChunkSet>,
    live: AtomicUsize,
    limits: AggregatorLimits,
    metrics: AggregatorMetrics,
}

impl ChunkAggregator {
    pub fn new(limits: AggregatorLimits) -> Self {
        Self {
            sets: DashMap::new(),
            live: AtomicUsize::new(0),
            limits,
            metrics: AggregatorMetrics::default(),
        }
    }

    pub fn limits(&self) -> AggregatorLimits {
        self.limits
    }

    /// Add one fragment. Returns the reassembled payload once the last
    /// missing fragment of its message arrives.
    ///
    /// A fragment whose sequence count disagrees with the live set for its
    /// id discards that set and starts a new one. A fragment arriving for a
    /// set that is already older than `max_age` expires that set first.
    /// A chunk whose index is not below its count is refused.
    pub fn submit(&self, chunk: Chunk, arrival: Instant) -> Result<Option<Bytes>, AggregatorError> {
        bump(&self.metrics.total_chunks);

        let Chunk {
            id,
            sequence_index,
            sequence_count,
            body,
        } = chunk;

        if sequence_index >= sequence_count {
            bump(&self.metrics.protocol_violations);
            tracing::warn!(
                correlation_id = %id,
                sequence_index,
                sequence_count,
                "rejecting chunk: sequence index out of range"
            );
            return Err(AggregatorError::SequenceOutOfRange {
                index: sequence_index,
                count: sequence_count,
            });
        }

        if sequence_count as usize > self.limits.max_fragments {
            bump(&self.metrics.capacity_rejections);
            tracing::warn!(
                correlation_id = %id,
                sequence_count,
                max_fragments = self.limits.max_fragments,
                "rejecting chunk: too many fragments"
            );
            return Err(AggregatorError::CapacityExceeded(CapacityLimit::Fragments {
                count: sequence_count,
                max: self.limits.max_fragments,
            }));
        }

        tracing::trace!(correlation_id = %id, sequence_index, sequence_count, "chunk received");

        match self.sets.entry(id) {
            Entry::Occupied(mut entry) => {
                let set = entry.get_mut();

                if set.sequence_count != sequence_count {
                    bump(&self.metrics.protocol_violations);
                    tracing::warn!(
                        correlation_id = %id,
                        expected = set.sequence_count,
                        got = sequence_count,
                        discarded_fragments = set.received,
                        "sequence count mismatch, discarding chunk set"
                    );
                    *set = ChunkSet::new(sequence_count, arrival);
                } else if set.is_stale(arrival, self.limits.max_age) {
                    self.metrics.record_expired(set.received);
                    tracing::debug!(
                        correlation_id = %id,
                        discarded_fragments = set.received,
                        "late chunk for outdated set, expiring it"
                    );
                    *set = ChunkSet::new(sequence_count, arrival);
                }

                if set.insert(sequence_index, body, arrival) {
                    bump(&self.metrics.duplicate_chunks);
                    tracing::debug!(correlation_id = %id, sequence_index, "duplicate chunk");
                }

                if !set.is_complete() {
                    return Ok(None);
                }
                let set = entry.remove();
                self.live.fetch_sub(1, Ordering::AcqRel);
                bump(&self.metrics.complete_messages);
                Ok(Some(set.reassemble()))
            }
            Entry::Vacant(entry) => {
                if sequence_count == 1 {
                    bump(&self.metrics.complete_messages);
                    return Ok(Some(body));
                }

                let max_sets = self.limits.max_sets;
                if self
                    .live
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                        (live < max_sets).then_some(live + 1)
                    })
                    .is_err()
                {
                    bump(&self.metrics.capacity_rejections);
                    tracing::warn!(correlation_id = %id, max_sets, "rejecting chunk: too many live sets");
                    return Err(AggregatorError::CapacityExceeded(CapacityLimit::LiveSets(max_sets)));
                }

                let mut set = ChunkSet::new(sequence_count, arrival);
                set.insert(sequence_index, body, arrival);
                entry.insert(set);
                Ok(None)
            }
        }
    }

    /// Drop every incomplete set first seen more than `max_age` before
    /// `now`. Returns how many sets were dropped.
    pub fn evict_stale(&self, now: Instant, max_age: Duration) -> usize {
        let mut evicted = 0;
        self.sets.retain(|id, set| {
            if !set.is_stale(now, max_age) {
                return true;
            }
            evicted += 1;
            self.live.fetch_sub(1, Ordering::AcqRel);
            self.metrics.record_expired(set.received);
            tracing::debug!(
                correlation_id = %id,
                received = set.received,
                expected = set.sequence_count,
                idle_ms = now.saturating_duration_since(set.last_arrival).as_millis() as u64,
                "evicting incomplete chunk set"
            );
            false
        });
        evicted
    }

    /// Number of incomplete sets currently held.
    pub fn waiting(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn metrics(&self) -> AggregatorSnapshot {
        self.metrics.snapshot(self.waiting())
    }
}
