//! End-to-end ingestion: every payload type, reassembly across threads,
//! eviction of abandoned chunk sets, and datagrams that must be refused.

use crate::*;

use std::collections::BTreeSet;
use std::thread;

use loghaul_core::decode::DecodeError;
use loghaul_core::wire::{split_into_chunks, CorrelationId, WireError};
use loghaul_services::{AggregatorError, AggregatorLimits, CapacityLimit, IngestError, SubmitOutcome};
use proptest::prelude::*;

// ══════════════════════════════════════════════════════════════════════════════
// Payload types
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn every_payload_type_reaches_the_sink() {
    let sink = MemorySink::new();
    let pipeline = running_pipeline(&sink);

    pipeline
        .submit(datagram(&br#"{"short_message":"plain"}"#[..]))
        .unwrap();
    pipeline.submit(datagram(zlib(b"via zlib"))).unwrap();
    pipeline.submit(datagram(gzip(b"via gzip"))).unwrap();

    let chunked = split_into_chunks(CorrelationId(*b"corr-id1"), &zlib(b"via chunks"), 4).unwrap();
    for fragment in chunked {
        pipeline.submit(datagram(fragment)).unwrap();
    }

    let report = pipeline.stop().unwrap();
    assert_eq!(report.abandoned(), 0);
    assert_eq!(report.pending_chunk_sets, 0);

    assert_eq!(
        sorted_texts(&sink),
        [r#"{"short_message":"plain"}"#, "via chunks", "via gzip", "via zlib"]
    );
    assert!(sink.messages().iter().all(|m| m.input_id == "integration"));
}

#[test]
fn remote_address_is_carried_to_the_sink() {
    let sink = MemorySink::new();
    let pipeline = running_pipeline(&sink);

    let peer = "192.0.2.7:40000".parse().unwrap();
    pipeline
        .submit(RawDatagram::new(&b"from a peer"[..], Some(peer)))
        .unwrap();
    pipeline.stop().unwrap();

    assert_eq!(sink.messages()[0].remote_addr, Some(peer));
}

// ══════════════════════════════════════════════════════════════════════════════
// Reassembly
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn interleaved_fragments_from_many_threads_reassemble_exactly_once() {
    const MESSAGES: usize = 40;
    const THREADS: usize = 4;

    let sink = MemorySink::new();
    let pipeline = Arc::new(
        test_builder()
            .process_buffer_size(256)
            .output_buffer_size(256)
            .insert_policy(loghaul_core::InsertPolicy::Cached)
            .sink(sink.clone())
            .build()
            .unwrap(),
    );
    pipeline.start().unwrap();

    // Every message is split into several fragments; fragments of all
    // messages are dealt round-robin to the threads, reversed, so each
    // message arrives out of order and from more than one thread.
    let mut expected = BTreeSet::new();
    let mut fragments = Vec::new();
    for n in 0..MESSAGES {
        let text = format!("message-{n:03}-{}", "p".repeat(n * 7));
        let id = CorrelationId((n as u64).to_be_bytes());
        fragments.extend(split_into_chunks(id, text.as_bytes(), 9).unwrap());
        expected.insert(text);
    }
    fragments.reverse();

    let mut hands: Vec<Vec<Bytes>> = vec![Vec::new(); THREADS];
    for (i, fragment) in fragments.into_iter().enumerate() {
        hands[i % THREADS].push(fragment);
    }

    let producers: Vec<_> = hands
        .into_iter()
        .map(|hand| {
            let pipeline = pipeline.clone();
            thread::spawn(move || {
                for fragment in hand {
                    pipeline.submit(datagram(fragment)).unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    let report = pipeline.stop().unwrap();
    assert_eq!(report.abandoned(), 0);
    assert_eq!(report.pending_chunk_sets, 0);

    let texts = sorted_texts(&sink);
    assert_eq!(texts.len(), MESSAGES, "each message delivered exactly once");
    assert_eq!(texts.into_iter().collect::<BTreeSet<_>>(), expected);

    let chunks = pipeline.snapshot().chunks;
    assert_eq!(chunks.complete_messages, MESSAGES as u64);
    assert_eq!(chunks.waiting_messages, 0);
}

#[test]
fn duplicate_fragment_does_not_duplicate_the_message() {
    let sink = MemorySink::new();
    let pipeline = running_pipeline(&sink);

    let fragments = split_into_chunks(CorrelationId([9; 8]), b"abcdefgh", 3).unwrap();
    assert_eq!(fragments.len(), 3);

    assert_eq!(pipeline.submit(datagram(fragments[0].clone())).unwrap(), SubmitOutcome::Pending);
    assert_eq!(pipeline.submit(datagram(fragments[0].clone())).unwrap(), SubmitOutcome::Pending);
    assert_eq!(pipeline.submit(datagram(fragments[2].clone())).unwrap(), SubmitOutcome::Pending);
    assert!(matches!(
        pipeline.submit(datagram(fragments[1].clone())).unwrap(),
        SubmitOutcome::Buffered { .. }
    ));

    pipeline.stop().unwrap();
    assert_eq!(sorted_texts(&sink), ["abcdefgh"]);
    assert_eq!(pipeline.snapshot().chunks.duplicate_chunks, 1);
}

#[test]
fn abandoned_chunk_set_is_evicted_in_the_background() {
    let sink = MemorySink::new();
    let pipeline = test_builder()
        .chunk_limits(AggregatorLimits {
            max_age: Duration::from_millis(200),
            ..AggregatorLimits::default()
        })
        .sink(sink.clone())
        .build()
        .unwrap();
    pipeline.start().unwrap();

    let fragments = split_into_chunks(CorrelationId([5; 8]), b"never finished", 4).unwrap();
    pipeline.submit(datagram(fragments[0].clone())).unwrap();
    pipeline.submit(datagram(fragments[1].clone())).unwrap();
    assert_eq!(pipeline.aggregator().waiting(), 1);

    assert!(wait_until(Duration::from_secs(5), || pipeline.aggregator().is_empty()));

    let chunks = pipeline.snapshot().chunks;
    assert_eq!(chunks.expired_messages, 1);
    assert_eq!(chunks.expired_chunks, 2);

    let report = pipeline.stop().unwrap();
    assert_eq!(report.pending_chunk_sets, 0);
    assert!(sink.is_empty());
}

#[test]
fn chunk_set_limit_refuses_new_ids_but_not_known_ones() {
    let sink = MemorySink::new();
    let pipeline = test_builder()
        .chunk_limits(AggregatorLimits {
            max_sets: 1,
            ..AggregatorLimits::default()
        })
        .sink(sink.clone())
        .build()
        .unwrap();
    pipeline.start().unwrap();

    let first = split_into_chunks(CorrelationId([1; 8]), b"first message", 5).unwrap();
    let second = split_into_chunks(CorrelationId([2; 8]), b"second message", 5).unwrap();

    pipeline.submit(datagram(first[0].clone())).unwrap();
    let err = pipeline.submit(datagram(second[0].clone())).unwrap_err();
    assert!(err.is_capacity());
    assert!(matches!(
        err,
        IngestError::Aggregator(AggregatorError::CapacityExceeded(CapacityLimit::LiveSets(1)))
    ));

    for fragment in &first[1..] {
        pipeline.submit(datagram(fragment.clone())).unwrap();
    }
    // The completed set frees its slot.
    pipeline.submit(datagram(second[0].clone())).unwrap();

    pipeline.stop().unwrap();
    assert_eq!(sorted_texts(&sink), ["first message"]);
    assert_eq!(pipeline.snapshot().pipeline.rejected, 1);
}

// ══════════════════════════════════════════════════════════════════════════════
// Refused datagrams
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn decompression_bomb_is_refused() {
    let sink = MemorySink::new();
    let pipeline = test_builder()
        .decompress_size_limit(1024)
        .sink(sink.clone())
        .build()
        .unwrap();
    pipeline.start().unwrap();

    let bomb = zlib(&vec![b'a'; 64 * 1024]);
    let err = pipeline.submit(datagram(bomb)).unwrap_err();
    assert!(matches!(
        err,
        IngestError::Decode(DecodeError::SizeLimitExceeded(1024))
    ));
    assert!(err.is_malformed());

    pipeline.submit(datagram(zlib(&[b'a'; 1024]))).unwrap();
    pipeline.stop().unwrap();
    assert_eq!(sink.len(), 1);
}

#[test]
fn bad_datagrams_never_reach_the_sink() {
    let sink = MemorySink::new();
    let pipeline = running_pipeline(&sink);

    let mut truncated = zlib(b"cut short");
    truncated.truncate(truncated.len() - 3);

    let bad: Vec<Vec<u8>> = vec![
        vec![],
        vec![b'{'],
        vec![0x1e, 0x0f, 0, 0],
        vec![0x78, 0x01, 0x02],
        truncated,
        vec![0xc3, 0x28, 0xa0],
    ];
    for payload in bad {
        let err = pipeline.submit(datagram(payload)).unwrap_err();
        assert!(err.is_malformed(), "{err}");
    }

    // Sequence index past the declared count.
    let mut fragment = split_into_chunks(CorrelationId([3; 8]), b"x", 8).unwrap()[0].to_vec();
    fragment[10] = 4;
    fragment[11] = 2;
    assert!(matches!(
        pipeline.submit(datagram(fragment)).unwrap_err(),
        IngestError::Wire(WireError::SequenceOutOfRange { index: 4, count: 2 })
    ));

    pipeline.stop().unwrap();
    assert!(sink.is_empty());
    let counters = pipeline.snapshot().pipeline;
    assert_eq!(counters.received, 7);
    assert_eq!(counters.discarded, 7);
    assert_eq!(counters.decoded, 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn arbitrary_datagrams_are_accepted_or_refused_without_panicking(
        payloads in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..64), 1..16)
    ) {
        let sink = MemorySink::new();
        let pipeline = running_pipeline(&sink);

        let mut accepted = 0;
        for payload in payloads {
            match pipeline.submit(datagram(payload)) {
                Ok(SubmitOutcome::Buffered { .. }) => accepted += 1,
                Ok(SubmitOutcome::Pending) => {}
                Err(e) => prop_assert!(e.is_malformed() || e.is_capacity(), "{}", e),
            }
        }

        let report = pipeline.stop().unwrap();
        prop_assert_eq!(report.abandoned(), 0);
        prop_assert_eq!(sink.len(), accepted);
    }
}
