//! Processing stages behind the two buffers.
//!
//! A `MessageFilter` runs on the process-buffer workers and may rewrite or
//! drop a message. A `ProcessedMessageSink` runs on the output-buffer
//! workers and is the hand-off to whatever persists messages. Both are
//! called concurrently from every worker in their pool.

use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;

use loghaul_core::message::{DecodedMessage, MessageEvent};

use crate::metrics::{bump, PipelineMetrics};
use crate::ring::RingBuffer;
use crate::worker::EventHandler;

/// Filter stage. `Ok(None)` drops the message.
pub trait MessageFilter: Send + Sync + 'static {
    fn filter(&self, message: DecodedMessage) -> Result<Option<DecodedMessage>>;
}

impl<F> MessageFilter for F
where
    F: Fn(DecodedMessage) -> Result<Option<DecodedMessage>> + Send + Sync + 'static,
{
    fn filter(&self, message: DecodedMessage) -> Result<Option<DecodedMessage>> {
        self(message)
    }
}

/// Output stage. Receives each message that survived filtering.
pub trait ProcessedMessageSink: Send + Sync + 'static {
    fn write(&self, message: &DecodedMessage) -> Result<()>;
}

/// Keeps every message.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl MessageFilter for PassThrough {
    fn filter(&self, message: DecodedMessage) -> Result<Option<DecodedMessage>> {
        Ok(Some(message))
    }
}

/// Collects written messages in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    messages: Arc<Mutex<Vec<DecodedMessage>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    pub fn messages(&self) -> Vec<DecodedMessage> {
        self.messages.lock().clone()
    }
}

impl ProcessedMessageSink for MemorySink {
    fn write(&self, message: &DecodedMessage) -> Result<()> {
        self.messages.lock().push(message.clone());
        Ok(())
    }
}

// ── Worker handlers ──────────────────────────────────────────────────────────

/// Process-buffer handler: filter, then publish survivors into the output
/// buffer with blocking backpressure.
pub(crate) struct FilterHandler {
    pub(crate) filter: Arc<dyn MessageFilter>,
    pub(crate) output: Arc<RingBuffer<MessageEvent>>,
    pub(crate) metrics: Arc<PipelineMetrics>,
}

impl EventHandler<MessageEvent> for FilterHandler {
    fn on_event(&self, event: MessageEvent, sequence: u64) -> Result<()> {
        let mut kept = Vec::with_capacity(event.len());
        let mut failure = None;

        for message in event.into_messages() {
            match self.filter.filter(message) {
                Ok(Some(message)) => kept.push(message),
                Ok(None) => bump(&self.metrics.filtered_out),
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }

        let forwarded = match kept.len() {
            0 => None,
            1 => kept.pop().map(MessageEvent::Single),
            _ => Some(MessageEvent::Batch(kept)),
        };
        if let Some(event) = forwarded {
            self.output
                .insert_cached(event)
                .with_context(|| format!("forwarding process event {sequence} to output buffer"))?;
        }

        match failure {
            Some(e) => Err(e.context(format!("filtering process event {sequence}"))),
            None => Ok(()),
        }
    }
}

/// Output-buffer handler: hand each message to the sink.
pub(crate) struct OutputHandler {
    pub(crate) sink: Arc<dyn ProcessedMessageSink>,
    pub(crate) metrics: Arc<PipelineMetrics>,
}

impl EventHandler<MessageEvent> for OutputHandler {
    fn on_event(&self, event: MessageEvent, sequence: u64) -> Result<()> {
        let mut failure = None;
        for message in event.messages() {
            match self.sink.write(message) {
                Ok(()) => bump(&self.metrics.written),
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        match failure {
            Some(e) => Err(e.context(format!("writing output event {sequence}"))),
            None => Ok(()),
        }
    }
}
