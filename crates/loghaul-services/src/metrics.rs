//! Read-only counters for the ingestion path.
//!
//! Every counter is a relaxed atomic; a snapshot is a consistent-enough
//! copy for logging, not a transactional view.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Chunk aggregator counters.
#[derive(Debug, Default)]
pub struct AggregatorMetrics {
    pub(crate) total_chunks: AtomicU64,
    pub(crate) complete_messages: AtomicU64,
    pub(crate) expired_messages: AtomicU64,
    pub(crate) expired_chunks: AtomicU64,
    pub(crate) duplicate_chunks: AtomicU64,
    pub(crate) protocol_violations: AtomicU64,
    pub(crate) capacity_rejections: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AggregatorSnapshot {
    pub total_chunks: u64,
    pub waiting_messages: u64,
    pub complete_messages: u64,
    pub expired_messages: u64,
    pub expired_chunks: u64,
    pub duplicate_chunks: u64,
    pub protocol_violations: u64,
    pub capacity_rejections: u64,
}

impl AggregatorMetrics {
    pub(crate) fn snapshot(&self, waiting_messages: usize) -> AggregatorSnapshot {
        AggregatorSnapshot {
            total_chunks: load(&self.total_chunks),
            waiting_messages: waiting_messages as u64,
            complete_messages: load(&self.complete_messages),
            expired_messages: load(&self.expired_messages),
            expired_chunks: load(&self.expired_chunks),
            duplicate_chunks: load(&self.duplicate_chunks),
            protocol_violations: load(&self.protocol_violations),
            capacity_rejections: load(&self.capacity_rejections),
        }
    }

    pub(crate) fn record_expired(&self, chunks: usize) {
        bump(&self.expired_messages);
        self.expired_chunks
            .fetch_add(chunks as u64, Ordering::Relaxed);
    }
}

/// Pipeline driver counters.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub(crate) received: AtomicU64,
    pub(crate) decoded: AtomicU64,
    pub(crate) discarded: AtomicU64,
    pub(crate) rejected: AtomicU64,
    pub(crate) filtered_out: AtomicU64,
    pub(crate) written: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineCounters {
    /// Datagrams handed to `submit`.
    pub received: u64,
    /// Messages decoded and published into the process buffer.
    pub decoded: u64,
    /// Datagrams dropped as malformed or undecodable.
    pub discarded: u64,
    /// Datagrams refused for capacity or backpressure reasons.
    pub rejected: u64,
    /// Messages a filter chose to drop.
    pub filtered_out: u64,
    /// Messages the sink accepted.
    pub written: u64,
}

impl PipelineMetrics {
    pub(crate) fn counters(&self) -> PipelineCounters {
        PipelineCounters {
            received: load(&self.received),
            decoded: load(&self.decoded),
            discarded: load(&self.discarded),
            rejected: load(&self.rejected),
            filtered_out: load(&self.filtered_out),
            written: load(&self.written),
        }
    }
}

/// Per-worker processing counters.
#[derive(Debug, Default)]
pub struct WorkerStats {
    processed: AtomicU64,
    failed: AtomicU64,
    total_nanos: AtomicU64,
    max_nanos: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerSnapshot {
    pub ordinal: usize,
    pub processed: u64,
    pub failed: u64,
    pub mean_latency_us: u64,
    pub max_latency_us: u64,
}

impl WorkerStats {
    pub(crate) fn record(&self, elapsed: Duration, ok: bool) {
        let nanos = elapsed.as_nanos().min(u64::MAX as u128) as u64;
        bump(&self.processed);
        if !ok {
            bump(&self.failed);
        }
        self.total_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.max_nanos.fetch_max(nanos, Ordering::Relaxed);
    }

    pub fn snapshot(&self, ordinal: usize) -> WorkerSnapshot {
        let processed = load(&self.processed);
        let total = load(&self.total_nanos);
        WorkerSnapshot {
            ordinal,
            processed,
            failed: load(&self.failed),
            mean_latency_us: total.checked_div(processed).unwrap_or(0) / 1_000,
            max_latency_us: load(&self.max_nanos) / 1_000,
        }
    }
}

/// Occupancy of one ring buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BufferSnapshot {
    pub capacity: usize,
    pub size: usize,
    pub utilization_pct: f64,
}

/// Everything the pipeline exposes, in one serializable value.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineSnapshot {
    pub state: &'static str,
    pub pipeline: PipelineCounters,
    pub chunks: AggregatorSnapshot,
    pub process_buffer: BufferSnapshot,
    pub output_buffer: BufferSnapshot,
    pub processors: Vec<WorkerSnapshot>,
    pub outputs: Vec<WorkerSnapshot>,
}

#[inline]
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[inline]
fn load(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}
