//! Pipeline driver: owns the buffers, pools, aggregator and evictor, and
//! moves a datagram from raw bytes to the process buffer.
//!
//! ```text
//! submit ─▶ classify ─▶ (parse ─▶ aggregate) ─▶ decode ─▶ process buffer
//!                                                            │ filter pool
//!                                                            ▼
//!                                    sink ◀─ output pool ◀─ output buffer
//! ```
//!
//! Lifecycle: `Stopped → Starting → Running → Stopping → Stopped`.

use std::ops::Range;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use loghaul_core::config::{ConfigError, InsertPolicy, LoghaulConfig};
use loghaul_core::decode::{DecodeError, PayloadDecoder};
use loghaul_core::message::{DecodedMessage, MessageEvent, RawDatagram};
use loghaul_core::wire::{self, MessageType, WireError};

use crate::aggregator::{AggregatorError, AggregatorLimits, ChunkAggregator};
use crate::evictor::Evictor;
use crate::metrics::{bump, PipelineMetrics, PipelineSnapshot};
use crate::ring::{BufferError, Refused, RingBuffer};
use crate::stage::{FilterHandler, MessageFilter, OutputHandler, PassThrough, ProcessedMessageSink};
use crate::worker::{PoolError, ShutdownReport, WorkerPool};

// ── State ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PipelineState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl PipelineState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("illegal state transition from {from} to {to}")]
    IllegalStateTransition {
        from: PipelineState,
        to: PipelineState,
    },

    #[error("pipeline is {0}, not running")]
    NotRunning(PipelineState),

    #[error("invalid pipeline settings: {0}")]
    InvalidSettings(String),

    #[error("pipeline has no sink")]
    MissingSink,

    #[error("failed to allocate buffer: {0}")]
    Buffer(#[from] BufferError),

    #[error("failed to start worker pool: {0}")]
    Pool(#[from] PoolError),

    #[error("failed to start chunk evictor: {0}")]
    Evictor(#[source] std::io::Error),
}

/// Why one datagram did not make it into the process buffer.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("malformed datagram: {0}")]
    Wire(#[from] WireError),

    #[error("undecodable payload: {0}")]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Aggregator(#[from] AggregatorError),

    /// Decoded, but the process buffer did not take it. The messages are
    /// handed back so the caller can re-offer them through
    /// [`Pipeline::publish`] or drop them.
    #[error("process buffer refused {} decoded message(s): {error}", .messages.len())]
    Refused {
        error: BufferError,
        messages: Vec<DecodedMessage>,
    },
}

impl IngestError {
    /// The datagram itself was bad. Retrying will not help.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            IngestError::Wire(_)
                | IngestError::Decode(_)
                | IngestError::Aggregator(AggregatorError::SequenceOutOfRange { .. })
        )
    }

    /// Refused for lack of room. The caller may retry or drop.
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            IngestError::Aggregator(AggregatorError::CapacityExceeded(_))
                | IngestError::Refused {
                    error: BufferError::OutOfCapacity { .. } | BufferError::BatchTooLarge { .. },
                    ..
                }
        )
    }

    /// The buffer error behind a refused publish.
    pub fn buffer_error(&self) -> Option<BufferError> {
        match self {
            IngestError::Refused { error, .. } => Some(*error),
            _ => None,
        }
    }

    /// Decoded messages carried by this error. Empty unless the process
    /// buffer refused them.
    pub fn into_messages(self) -> Vec<DecodedMessage> {
        match self {
            IngestError::Refused { messages, .. } => messages,
            _ => Vec::new(),
        }
    }
}

// ── Outcomes ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Decoded and published at this process-buffer sequence.
    Buffered { sequence: u64 },
    /// A fragment was stored; its message is not complete yet.
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Process-buffer sequences the decoded messages occupy.
    pub buffered: Range<u64>,
    /// Fragments stored without completing a message.
    pub pending: usize,
    /// Datagrams dropped as malformed or refused by the aggregator.
    pub discarded: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopReport {
    pub process: ShutdownReport,
    pub output: ShutdownReport,
    /// Incomplete chunk sets still held at stop.
    pub pending_chunk_sets: usize,
}

impl StopReport {
    pub fn abandoned(&self) -> u64 {
        self.process.abandoned + self.output.abandoned
    }
}

// ── Settings ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub process_buffer_size: usize,
    pub output_buffer_size: usize,
    pub insert_policy: InsertPolicy,
    pub processors: usize,
    pub outputs: usize,
    pub chunk_limits: AggregatorLimits,
    pub eviction_period: Duration,
    pub decompress_size_limit: usize,
    pub drain_timeout: Duration,
    pub input_id: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&LoghaulConfig::default())
    }
}

impl From<&LoghaulConfig> for PipelineSettings {
    fn from(config: &LoghaulConfig) -> Self {
        Self {
            process_buffer_size: config.buffers.process_buffer_size,
            output_buffer_size: config.buffers.output_buffer_size,
            insert_policy: config.buffers.insert_policy,
            processors: config.workers.processors,
            outputs: config.workers.outputs,
            chunk_limits: AggregatorLimits::from(&config.chunks),
            eviction_period: config.chunks.eviction_period(),
            decompress_size_limit: config.decoder.decompress_size_limit,
            drain_timeout: config.shutdown.drain_timeout(),
            input_id: config.listener.input_id.clone(),
        }
    }
}

impl PipelineSettings {
    /// The same settings expressed as config sections, so both share one
    /// set of validation rules.
    fn to_config(&self) -> LoghaulConfig {
        let millis = |d: Duration| match d.as_millis() {
            0 if !d.is_zero() => 1,
            ms => ms.min(u64::MAX as u128) as u64,
        };
        let mut config = LoghaulConfig::default();
        config.buffers.process_buffer_size = self.process_buffer_size;
        config.buffers.output_buffer_size = self.output_buffer_size;
        config.buffers.insert_policy = self.insert_policy;
        config.workers.processors = self.processors;
        config.workers.outputs = self.outputs;
        config.chunks.max_age_ms = millis(self.chunk_limits.max_age);
        config.chunks.eviction_period_ms = millis(self.eviction_period);
        config.chunks.max_sets = self.chunk_limits.max_sets;
        config.chunks.max_fragments = self.chunk_limits.max_fragments;
        config.decoder.decompress_size_limit = self.decompress_size_limit;
        config.shutdown.drain_timeout_ms = millis(self.drain_timeout);
        config.listener.input_id = self.input_id.clone();
        config
    }

    fn validate(&self) -> Result<(), PipelineError> {
        self.to_config().validate().map_err(|e| match e {
            ConfigError::Invalid(what) => PipelineError::InvalidSettings(what),
            other => PipelineError::InvalidSettings(other.to_string()),
        })
    }
}

// ── Builder ──────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct PipelineBuilder {
    settings: PipelineSettings,
    filter: Option<Arc<dyn MessageFilter>>,
    sink: Option<Arc<dyn ProcessedMessageSink>>,
}

impl PipelineBuilder {
    pub fn config(mut self, config: &LoghaulConfig) -> Self {
        self.settings = PipelineSettings::from(config);
        self
    }

    pub fn settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn process_buffer_size(mut self, size: usize) -> Self {
        self.settings.process_buffer_size = size;
        self
    }

    pub fn output_buffer_size(mut self, size: usize) -> Self {
        self.settings.output_buffer_size = size;
        self
    }

    pub fn insert_policy(mut self, policy: InsertPolicy) -> Self {
        self.settings.insert_policy = policy;
        self
    }

    pub fn processors(mut self, count: usize) -> Self {
        self.settings.processors = count;
        self
    }

    pub fn outputs(mut self, count: usize) -> Self {
        self.settings.outputs = count;
        self
    }

    pub fn chunk_limits(mut self, limits: AggregatorLimits) -> Self {
        self.settings.chunk_limits = limits;
        self
    }

    pub fn eviction_period(mut self, period: Duration) -> Self {
        self.settings.eviction_period = period;
        self
    }

    pub fn decompress_size_limit(mut self, limit: usize) -> Self {
        self.settings.decompress_size_limit = limit;
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.settings.drain_timeout = timeout;
        self
    }

    pub fn input_id(mut self, id: impl Into<String>) -> Self {
        self.settings.input_id = id.into();
        self
    }

    pub fn filter(mut self, filter: impl MessageFilter) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn sink(mut self, sink: impl ProcessedMessageSink) -> Self {
        self.sink = Some(Arc::new(sink));
        self
    }

    pub fn shared_sink(mut self, sink: Arc<dyn ProcessedMessageSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> Result<Pipeline, PipelineError> {
        self.settings.validate()?;
        let sink = self.sink.ok_or(PipelineError::MissingSink)?;
        let filter = self.filter.unwrap_or_else(|| Arc::new(PassThrough));
        let decoder = PayloadDecoder::new(self.settings.decompress_size_limit);

        Ok(Pipeline {
            aggregator: Arc::new(ChunkAggregator::new(self.settings.chunk_limits)),
            decoder,
            settings: self.settings,
            filter,
            sink,
            metrics: Arc::new(PipelineMetrics::default()),
            state: AtomicU8::new(PipelineState::Stopped as u8),
            process: RwLock::new(None),
            runtime: Mutex::new(None),
        })
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

/// Everything that exists only while the pipeline runs.
struct Runtime {
    process: Arc<RingBuffer<MessageEvent>>,
    output: Arc<RingBuffer<MessageEvent>>,
    process_pool: WorkerPool<MessageEvent>,
    output_pool: WorkerPool<MessageEvent>,
    evictor: Evictor,
}

pub struct Pipeline {
    settings: PipelineSettings,
    decoder: PayloadDecoder,
    aggregator: Arc<ChunkAggregator>,
    filter: Arc<dyn MessageFilter>,
    sink: Arc<dyn ProcessedMessageSink>,
    metrics: Arc<PipelineMetrics>,
    state: AtomicU8,
    /// Producer-side handle on the process buffer. Cloned out per submit so
    /// no lock is held while a cached insert blocks.
    process: RwLock<Option<Arc<RingBuffer<MessageEvent>>>>,
    runtime: Mutex<Option<Runtime>>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    pub fn state(&self) -> PipelineState {
        PipelineState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn aggregator(&self) -> &ChunkAggregator {
        &self.aggregator
    }

    fn transition(&self, from: PipelineState, to: PipelineState) -> Result<(), PipelineError> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|current| PipelineError::IllegalStateTransition {
                from: PipelineState::from_u8(current),
                to,
            })
    }

    /// Allocate both buffers, register every worker, start the evictor and
    /// begin accepting datagrams.
    pub fn start(&self) -> Result<(), PipelineError> {
        self.transition(PipelineState::Stopped, PipelineState::Starting)?;

        match self.start_runtime() {
            Ok(runtime) => {
                *self.process.write() = Some(runtime.process.clone());
                *self.runtime.lock() = Some(runtime);
                self.state.store(PipelineState::Running as u8, Ordering::SeqCst);
                tracing::info!(
                    processors = self.settings.processors,
                    outputs = self.settings.outputs,
                    process_buffer = self.settings.process_buffer_size,
                    output_buffer = self.settings.output_buffer_size,
                    policy = ?self.settings.insert_policy,
                    "pipeline running"
                );
                Ok(())
            }
            Err(e) => {
                self.state.store(PipelineState::Stopped as u8, Ordering::SeqCst);
                tracing::error!(error = %e, "pipeline failed to start");
                Err(e)
            }
        }
    }

    fn start_runtime(&self) -> Result<Runtime, PipelineError> {
        let s = &self.settings;
        let process = Arc::new(RingBuffer::new(s.process_buffer_size, s.insert_policy)?);
        let output = Arc::new(RingBuffer::new(s.output_buffer_size, InsertPolicy::Cached)?);

        let output_pool = WorkerPool::start(
            "output",
            output.clone(),
            s.outputs,
            Arc::new(OutputHandler {
                sink: self.sink.clone(),
                metrics: self.metrics.clone(),
            }),
        )?;
        let process_pool = WorkerPool::start(
            "processor",
            process.clone(),
            s.processors,
            Arc::new(FilterHandler {
                filter: self.filter.clone(),
                output: output.clone(),
                metrics: self.metrics.clone(),
            }),
        )?;
        let evictor =
            Evictor::spawn(self.aggregator.clone(), s.eviction_period).map_err(PipelineError::Evictor)?;

        Ok(Runtime {
            process,
            output,
            process_pool,
            output_pool,
            evictor,
        })
    }

    /// Stop accepting, drain both stages in order, stop the evictor.
    ///
    /// The drain timeout covers both pools together.
    pub fn stop(&self) -> Result<StopReport, PipelineError> {
        self.transition(PipelineState::Running, PipelineState::Stopping)?;
        tracing::info!("pipeline stopping");

        self.process.write().take();
        let runtime = self.runtime.lock().take();
        let Some(runtime) = runtime else {
            self.state.store(PipelineState::Stopped as u8, Ordering::SeqCst);
            return Err(PipelineError::NotRunning(PipelineState::Stopping));
        };

        let deadline = Instant::now() + self.settings.drain_timeout;

        // Closing first wakes producers parked in a cached insert; what was
        // already published is still drained.
        runtime.process.close();
        let process = runtime.process_pool.shutdown(self.settings.drain_timeout);

        runtime.output.close();
        let output = runtime
            .output_pool
            .shutdown(deadline.saturating_duration_since(Instant::now()));

        runtime.evictor.stop();

        let report = StopReport {
            process,
            output,
            pending_chunk_sets: self.aggregator.waiting(),
        };
        self.state.store(PipelineState::Stopped as u8, Ordering::SeqCst);
        tracing::info!(
            abandoned = report.abandoned(),
            pending_chunk_sets = report.pending_chunk_sets,
            "pipeline stopped"
        );
        Ok(report)
    }

    fn process_buffer(&self) -> Result<Arc<RingBuffer<MessageEvent>>, PipelineError> {
        let state = self.state();
        if state != PipelineState::Running {
            return Err(PipelineError::NotRunning(state));
        }
        self.process
            .read()
            .clone()
            .ok_or(PipelineError::NotRunning(state))
    }

    /// Feed one datagram through classification, reassembly and decoding,
    /// and publish the result using the configured insert policy.
    pub fn submit(&self, datagram: RawDatagram) -> Result<SubmitOutcome, IngestError> {
        let buffer = self.process_buffer()?;
        bump(&self.metrics.received);

        let message = match self.ingest(&datagram) {
            Ok(Some(message)) => message,
            Ok(None) => return Ok(SubmitOutcome::Pending),
            Err(e) => {
                self.record_failure(&e, &datagram);
                return Err(e);
            }
        };

        match buffer.offer_batch(vec![MessageEvent::Single(message)]) {
            Ok(range) => {
                bump(&self.metrics.decoded);
                Ok(SubmitOutcome::Buffered {
                    sequence: range.start,
                })
            }
            Err(refused) => {
                let e = refused_error(refused);
                self.record_failure(&e, &datagram);
                Err(e)
            }
        }
    }

    /// Feed several datagrams and publish every message they complete as
    /// one atomic batch. Bad datagrams are counted and skipped; a refused
    /// batch publishes nothing.
    pub fn submit_batch(&self, datagrams: Vec<RawDatagram>) -> Result<BatchOutcome, IngestError> {
        let buffer = self.process_buffer()?;
        let mut events = Vec::with_capacity(datagrams.len());
        let mut pending = 0;
        let mut discarded = 0;

        for datagram in &datagrams {
            bump(&self.metrics.received);
            match self.ingest(datagram) {
                Ok(Some(message)) => events.push(MessageEvent::Single(message)),
                Ok(None) => pending += 1,
                Err(e) => {
                    self.record_failure(&e, datagram);
                    discarded += 1;
                }
            }
        }

        let count = events.len() as u64;
        match buffer.offer_batch(events) {
            Ok(buffered) => {
                self.metrics.decoded.fetch_add(count, Ordering::Relaxed);
                Ok(BatchOutcome {
                    buffered,
                    pending,
                    discarded,
                })
            }
            Err(refused) => {
                self.metrics.rejected.fetch_add(count, Ordering::Relaxed);
                tracing::warn!(error = %refused.error, messages = count, "process buffer refused batch");
                Err(refused_error(refused))
            }
        }
    }

    /// Publish an already-decoded event, bypassing the decode path.
    pub fn publish(&self, event: MessageEvent) -> Result<u64, IngestError> {
        let buffer = self.process_buffer()?;
        let count = event.len() as u64;
        match buffer.offer_batch(vec![event]) {
            Ok(range) => {
                self.metrics.decoded.fetch_add(count, Ordering::Relaxed);
                Ok(range.start)
            }
            Err(refused) => {
                bump(&self.metrics.rejected);
                Err(refused_error(refused))
            }
        }
    }

    /// Classify, reassemble if chunked, and decode. `Ok(None)` means the
    /// datagram was a fragment of a message that is not complete yet.
    fn ingest(&self, datagram: &RawDatagram) -> Result<Option<DecodedMessage>, IngestError> {
        let kind = wire::classify(&datagram.payload)?;

        let (kind, payload) = if kind == MessageType::Chunked {
            let chunk = wire::parse_chunk(&datagram.payload)?;
            match self.aggregator.submit(chunk, datagram.received_at)? {
                None => return Ok(None),
                // A reassembled `Chunked` payload is refused by the decoder.
                Some(reassembled) => (wire::classify(&reassembled)?, reassembled),
            }
        } else {
            (kind, datagram.payload.clone())
        };

        let text = self.decoder.decode(kind, &payload)?;
        Ok(Some(DecodedMessage {
            text,
            input_id: self.settings.input_id.clone(),
            remote_addr: datagram.remote_addr,
            received_at: datagram.timestamp,
            decode_time: datagram.received_at.elapsed(),
        }))
    }

    fn record_failure(&self, error: &IngestError, datagram: &RawDatagram) {
        if error.is_capacity() {
            bump(&self.metrics.rejected);
            tracing::warn!(error = %error, remote = ?datagram.remote_addr, "datagram refused");
        } else if error.is_malformed() {
            bump(&self.metrics.discarded);
            tracing::debug!(error = %error, remote = ?datagram.remote_addr, len = datagram.len(), "discarding datagram");
        } else {
            bump(&self.metrics.rejected);
            tracing::debug!(error = %error, "datagram not accepted");
        }
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        let runtime = self.runtime.lock();
        let mut snapshot = PipelineSnapshot {
            state: self.state().as_str(),
            pipeline: self.metrics.counters(),
            chunks: self.aggregator.metrics(),
            ..PipelineSnapshot::default()
        };
        if let Some(rt) = runtime.as_ref() {
            snapshot.process_buffer = rt.process.snapshot();
            snapshot.output_buffer = rt.output.snapshot();
            snapshot.processors = rt.process_pool.stats();
            snapshot.outputs = rt.output_pool.stats();
        }
        snapshot
    }
}

fn refused_error(refused: Refused<MessageEvent>) -> IngestError {
    IngestError::Refused {
        error: refused.error,
        messages: refused
            .events
            .into_iter()
            .flat_map(MessageEvent::into_messages)
            .collect(),
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.state() == PipelineState::Running {
            if let Err(e) = self.stop() {
                tracing::warn!(error = %e, "pipeline stop on drop failed");
            }
        }
    }
}
