//! Full buffers: fail-fast refusal, cached blocking, atomic batches, and
//! what a stop does with events still in flight.

use crate::*;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use loghaul_core::config::InsertPolicy;
use loghaul_core::message::MessageEvent;
use loghaul_core::wire::{split_into_chunks, CorrelationId};
use loghaul_services::{BufferError, ProcessedMessageSink};

fn gated_pipeline(sink: &MemorySink, gate: &Gate, policy: InsertPolicy) -> Pipeline {
    let pipeline = test_builder()
        .process_buffer_size(4)
        .processors(1)
        .insert_policy(policy)
        .filter(gate.clone())
        .sink(sink.clone())
        .build()
        .unwrap();
    pipeline.start().unwrap();
    pipeline
}

// ══════════════════════════════════════════════════════════════════════════════
// Insert policies
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn fail_fast_refuses_once_the_process_buffer_is_full() {
    let sink = MemorySink::new();
    let gate = Gate::default();
    let pipeline = gated_pipeline(&sink, &gate, InsertPolicy::FailFast);

    for n in 0..4 {
        pipeline.submit(datagram(format!("held-{n}"))).unwrap();
    }
    let err = pipeline.submit(datagram(&b"one too many"[..])).unwrap_err();
    assert!(err.is_capacity());
    assert_eq!(
        err.buffer_error(),
        Some(BufferError::OutOfCapacity { requested: 1, available: 0 })
    );
    assert_eq!(pipeline.snapshot().process_buffer.size, 4);

    gate.open();
    let report = pipeline.stop().unwrap();
    assert_eq!(report.abandoned(), 0);
    assert_eq!(sink.len(), 4);

    let counters = pipeline.snapshot().pipeline;
    assert_eq!(counters.decoded, 4);
    assert_eq!(counters.rejected, 1);
}

#[test]
fn cached_insert_waits_for_room_instead_of_failing() {
    let sink = MemorySink::new();
    let gate = Gate::default();
    let pipeline = Arc::new(gated_pipeline(&sink, &gate, InsertPolicy::Cached));

    let submitted = Arc::new(AtomicUsize::new(0));
    let producer = {
        let pipeline = pipeline.clone();
        let submitted = submitted.clone();
        thread::spawn(move || {
            for n in 0..10 {
                pipeline.submit(datagram(format!("cached-{n:02}"))).unwrap();
                submitted.fetch_add(1, Ordering::SeqCst);
            }
        })
    };

    assert!(wait_until(Duration::from_secs(5), || submitted.load(Ordering::SeqCst) == 4));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(submitted.load(Ordering::SeqCst), 4, "producer parks on a full buffer");
    assert!(!producer.is_finished());

    gate.open();
    producer.join().unwrap();

    let report = pipeline.stop().unwrap();
    assert_eq!(report.abandoned(), 0);
    let expected: Vec<_> = (0..10).map(|n| format!("cached-{n:02}")).collect();
    assert_eq!(sorted_texts(&sink), expected);
}

#[test]
fn batch_is_published_whole_or_not_at_all() {
    let sink = MemorySink::new();
    let gate = Gate::default();
    let pipeline = gated_pipeline(&sink, &gate, InsertPolicy::FailFast);

    let first: Vec<_> = ["a", "b", "c"].iter().map(|t| datagram(t.repeat(2))).collect();
    let outcome = pipeline.submit_batch(first).unwrap();
    assert_eq!(outcome.buffered, 0..3);
    assert_eq!((outcome.pending, outcome.discarded), (0, 0));

    let second: Vec<_> = ["d", "e", "f"].iter().map(|t| datagram(t.repeat(2))).collect();
    let err = pipeline.submit_batch(second).unwrap_err();
    assert_eq!(
        err.buffer_error(),
        Some(BufferError::OutOfCapacity { requested: 3, available: 1 })
    );
    let returned: Vec<_> = err.into_messages().into_iter().map(|m| m.text).collect();
    assert_eq!(returned, ["dd", "ee", "ff"]);

    let oversized: Vec<_> = (0..5).map(|n| datagram(format!("big-{n}"))).collect();
    assert_eq!(
        pipeline.submit_batch(oversized).unwrap_err().buffer_error(),
        Some(BufferError::BatchTooLarge { batch: 5, capacity: 4 })
    );

    gate.open();
    pipeline.stop().unwrap();
    assert_eq!(sorted_texts(&sink), ["aa", "bb", "cc"]);
}

#[test]
fn refused_reassembled_message_can_be_published_later() {
    let sink = MemorySink::new();
    let gate = Gate::default();
    let pipeline = test_builder()
        .process_buffer_size(2)
        .processors(1)
        .insert_policy(InsertPolicy::FailFast)
        .filter(gate.clone())
        .sink(sink.clone())
        .build()
        .unwrap();
    pipeline.start().unwrap();

    pipeline.submit(datagram(&b"aa"[..])).unwrap();
    pipeline.submit(datagram(&b"bb"[..])).unwrap();

    let fragments = split_into_chunks(CorrelationId([6; 8]), b"chunked-msg", 4).unwrap();
    let (last, rest) = fragments.split_last().unwrap();
    for fragment in rest {
        pipeline.submit(datagram(fragment.clone())).unwrap();
    }
    let err = pipeline.submit(datagram(last.clone())).unwrap_err();
    assert!(err.is_capacity());
    assert_eq!(
        err.buffer_error(),
        Some(BufferError::OutOfCapacity { requested: 1, available: 0 })
    );
    // The set is gone once complete; the message travels in the error.
    assert!(pipeline.aggregator().is_empty());
    let returned = err.into_messages();
    assert_eq!(returned.len(), 1);
    assert_eq!(returned[0].text, "chunked-msg");
    assert_eq!(returned[0].input_id, "integration");

    gate.open();
    assert!(wait_until(Duration::from_secs(5), || pipeline.snapshot().process_buffer.size == 0));
    pipeline.publish(MessageEvent::Batch(returned)).unwrap();

    pipeline.stop().unwrap();
    assert_eq!(sorted_texts(&sink), ["aa", "bb", "chunked-msg"]);
}

#[test]
fn batch_skips_bad_datagrams_and_counts_fragments() {
    let sink = MemorySink::new();
    let pipeline = running_pipeline(&sink);

    let fragments = split_into_chunks(CorrelationId([7; 8]), b"split", 2).unwrap();
    let mut batch = vec![datagram(&b"good"[..]), datagram(&b"{"[..])];
    batch.extend(fragments.into_iter().map(datagram));

    let outcome = pipeline.submit_batch(batch).unwrap();
    assert_eq!(outcome.buffered.end - outcome.buffered.start, 2);
    assert_eq!(outcome.pending, 2);
    assert_eq!(outcome.discarded, 1);

    pipeline.stop().unwrap();
    assert_eq!(sorted_texts(&sink), ["good", "split"]);
}

#[test]
fn published_events_bypass_decoding() {
    let sink = MemorySink::new();
    let pipeline = running_pipeline(&sink);

    let message = DecodedMessage {
        text: "already decoded".into(),
        input_id: "elsewhere".into(),
        remote_addr: None,
        received_at: std::time::SystemTime::now(),
        decode_time: Duration::ZERO,
    };
    pipeline
        .publish(MessageEvent::Batch(vec![message.clone(), message]))
        .unwrap();

    pipeline.stop().unwrap();
    assert_eq!(sink.len(), 2);
    assert!(sink.messages().iter().all(|m| m.input_id == "elsewhere"));
    assert_eq!(pipeline.snapshot().pipeline.decoded, 2);
}

// ══════════════════════════════════════════════════════════════════════════════
// Drain on stop
// ══════════════════════════════════════════════════════════════════════════════

/// Sink that takes a little time per message.
struct SlowSink {
    inner: MemorySink,
}

impl ProcessedMessageSink for SlowSink {
    fn write(&self, message: &DecodedMessage) -> anyhow::Result<()> {
        thread::sleep(Duration::from_millis(1));
        self.inner.write(message)
    }
}

#[test]
fn stop_drains_everything_already_accepted() {
    let sink = MemorySink::new();
    let pipeline = test_builder()
        .process_buffer_size(128)
        .insert_policy(InsertPolicy::Cached)
        .sink(SlowSink { inner: sink.clone() })
        .build()
        .unwrap();
    pipeline.start().unwrap();

    for n in 0..100 {
        pipeline.submit(datagram(format!("drain-{n:03}"))).unwrap();
    }
    let report = pipeline.stop().unwrap();

    assert!(report.process.is_clean());
    assert!(report.output.is_clean());
    assert_eq!(report.process.drain_target, 100);
    assert_eq!(sink.len(), 100);
    assert_eq!(pipeline.snapshot().pipeline.written, 100);
}

#[test]
fn drain_timeout_reports_abandoned_events() {
    let sink = MemorySink::new();
    let gate = Gate::default();
    let pipeline = test_builder()
        .process_buffer_size(4)
        .processors(1)
        .drain_timeout(Duration::from_millis(100))
        .filter(gate.clone())
        .sink(sink.clone())
        .build()
        .unwrap();
    pipeline.start().unwrap();

    for n in 0..3 {
        pipeline.submit(datagram(format!("stuck-{n}"))).unwrap();
    }

    let started = Instant::now();
    let report = pipeline.stop().unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));

    assert_eq!(report.process.drain_target, 3);
    assert_eq!(report.process.abandoned, 3);
    assert_eq!(report.process.detached_workers, 1);
    assert_eq!(report.abandoned(), 3);

    // Release the detached worker; the output buffer is already closed.
    gate.open();
    assert!(sink.is_empty());
}
