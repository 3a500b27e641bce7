//! loghaul integration test harness.
//!
//! Tests drive a real pipeline end to end: datagrams in through `submit`,
//! messages out through an in-memory sink, on the pipeline's own worker
//! threads.
//!
//!   cargo test --test integration

use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use parking_lot::{Condvar, Mutex};

use loghaul_core::message::{DecodedMessage, RawDatagram};
use loghaul_services::{MemorySink, MessageFilter, Pipeline, PipelineBuilder};

mod backpressure;
mod ingest;

// ── Harness ───────────────────────────────────────────────────────────────────

pub fn zlib(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

pub fn datagram(payload: impl Into<Bytes>) -> RawDatagram {
    RawDatagram::new(payload, None)
}

/// A small pipeline suitable for tests. Callers add a sink and build.
pub fn test_builder() -> PipelineBuilder {
    Pipeline::builder()
        .process_buffer_size(64)
        .output_buffer_size(64)
        .processors(3)
        .outputs(2)
        .eviction_period(Duration::from_millis(20))
        .drain_timeout(Duration::from_secs(5))
        .input_id("integration")
}

pub fn running_pipeline(sink: &MemorySink) -> Pipeline {
    let pipeline = test_builder().sink(sink.clone()).build().unwrap();
    pipeline.start().unwrap();
    pipeline
}

pub fn sorted_texts(sink: &MemorySink) -> Vec<String> {
    let mut texts: Vec<_> = sink.messages().into_iter().map(|m| m.text).collect();
    texts.sort();
    texts
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// A filter that holds every message until the gate is opened.
#[derive(Clone, Default)]
pub struct Gate {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Gate {
    pub fn open(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock() = true;
        cvar.notify_all();
    }
}

impl MessageFilter for Gate {
    fn filter(&self, message: DecodedMessage) -> anyhow::Result<Option<DecodedMessage>> {
        let (lock, cvar) = &*self.inner;
        let mut open = lock.lock();
        while !*open {
            cvar.wait(&mut open);
        }
        Ok(Some(message))
    }
}
