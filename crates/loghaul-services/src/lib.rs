//! loghaul-services: the stateful half of the ingestion core.
//!
//! Chunk aggregation and eviction, the bounded ring buffer, worker pools,
//! processing stages, and the pipeline driver that wires them together.

pub mod aggregator;
pub mod evictor;
pub mod metrics;
pub mod pipeline;
pub mod ring;
pub mod stage;
pub mod worker;

pub use aggregator::{AggregatorError, AggregatorLimits, CapacityLimit, ChunkAggregator};
pub use evictor::Evictor;
pub use metrics::{AggregatorSnapshot, BufferSnapshot, PipelineCounters, PipelineSnapshot, WorkerSnapshot};
pub use pipeline::{
    BatchOutcome, IngestError, Pipeline, PipelineBuilder, PipelineError, PipelineSettings,
    PipelineState, StopReport, SubmitOutcome,
};
pub use ring::{BufferError, Refused, RingBuffer, Sequence};
pub use stage::{MemorySink, MessageFilter, PassThrough, ProcessedMessageSink};
pub use worker::{EventHandler, PoolError, ShutdownReport, WorkerPool};
