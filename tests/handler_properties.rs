//! Behavioural properties of the fragment handler, exercised through the public API.

use bytes::Bytes;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_evb::error::EvbError;
use rust_evb::fragment::{encode_fragments, Fragment};
use rust_evb::handler::{FragmentHandler, HandlerSettings, NO_OLDEST_TIMESTAMP};
use rust_evb::statistics::{DuplicateSourceStats, DuplicateTimestampStatistics, EventCounter};
use std::sync::Arc;
use std::time::Duration;

fn frag(ts: u64, sid: u32) -> Fragment {
    Fragment::new(ts, sid, 0, Bytes::from_static(b"fragment"))
}

fn collect_output(handler: &mut FragmentHandler) -> Arc<Mutex<Vec<Fragment>>> {
    let out = Arc::new(Mutex::new(Vec::new()));
    let sink = out.clone();
    handler.add_event_observer(Box::new(move |batch: &[Fragment]| {
        sink.lock().extend_from_slice(batch);
    }));
    out
}

#[test]
fn output_is_globally_ordered() {
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for round in 0..20 {
        let sources = rng.gen_range(1..=6u32);
        let mut handler = FragmentHandler::default();
        for sid in 1..=sources {
            handler.create_source_queue(&format!("crate{sid}"), sid);
        }
        let out = collect_output(&mut handler);

        // Each source is internally ordered; sources interleave arbitrarily.
        let mut clocks = vec![0u64; sources as usize];
        let mut pending = Vec::new();
        let mut submitted = 0usize;
        for _ in 0..rng.gen_range(1..300) {
            let index = rng.gen_range(0..sources as usize);
            clocks[index] += rng.gen_range(0..50);
            pending.push(frag(clocks[index], index as u32 + 1));
            if rng.gen_bool(0.2) {
                submitted += pending.len();
                handler.add_fragments(&encode_fragments(&pending)).unwrap();
                pending.clear();
            }
        }
        submitted += pending.len();
        handler.add_fragments(&encode_fragments(&pending)).unwrap();
        handler.flush();

        let out = out.lock();
        assert_eq!(out.len(), submitted, "round {round}: every fragment emitted");
        assert!(
            out.windows(2)
                .all(|pair| pair[0].timestamp() <= pair[1].timestamp()),
            "round {round}: output out of order"
        );
    }
}

fn barrier(ts: u64, sid: u32, kind: u32) -> Fragment {
    Fragment::new(ts, sid, kind, Bytes::new())
}

fn event_timestamps(out: &[Fragment]) -> Vec<u64> {
    out.iter()
        .filter(|f| !f.is_barrier())
        .map(Fragment::timestamp)
        .collect()
}

#[test]
fn older_data_behind_pending_barrier_is_released_first() {
    let mut handler = FragmentHandler::default();
    for sid in 1..=3 {
        handler.create_source_queue("crate", sid);
    }
    let out = collect_output(&mut handler);
    let partial = Arc::new(Mutex::new(Vec::new()));
    let p = partial.clone();
    handler.add_partial_barrier_observer(Box::new(
        move |_: &[(u32, u32)], missing: &[u32]| p.lock().push(missing.to_vec()),
    ));

    handler
        .add_fragments(&encode_fragments(&[barrier(10, 1, 1), frag(50, 2), frag(70, 2)]))
        .unwrap();
    assert!(handler.statistics().barrier_pending);
    handler.add_fragments(&encode_fragments(&[frag(20, 3)])).unwrap();
    assert_eq!(event_timestamps(&out.lock()), vec![20]);
    handler.flush();

    assert_eq!(event_timestamps(&out.lock()), vec![20, 50, 70]);
    assert_eq!(*partial.lock(), vec![vec![2, 3]]);
}

#[test]
fn output_is_globally_ordered_across_barrier_epochs() {
    let mut rng = StdRng::seed_from_u64(0xba77);

    for round in 0..20 {
        let sources = rng.gen_range(1..=5u32);
        let epochs = rng.gen_range(1..=4u64);
        let mut handler = FragmentHandler::default();
        for sid in 1..=sources {
            handler.create_source_queue(&format!("crate{sid}"), sid);
        }
        let out = collect_output(&mut handler);
        let complete = Arc::new(Mutex::new(0u32));
        let c = complete.clone();
        handler.add_barrier_observer(Box::new(move |_: &[(u32, u32)]| *c.lock() += 1));
        let partial = Arc::new(Mutex::new(0u32));
        let p = partial.clone();
        handler.add_partial_barrier_observer(Box::new(move |_: &[(u32, u32)], _: &[u32]| {
            *p.lock() += 1
        }));

        // Every source closes each epoch with a barrier stamped at the epoch
        // boundary; data of later epochs is strictly newer.
        let mut streams: Vec<Vec<Fragment>> = (1..=sources)
            .map(|sid| {
                let mut stream = Vec::new();
                for epoch in 0..epochs {
                    let mut clock = epoch * 10_000;
                    for _ in 0..rng.gen_range(0..40) {
                        clock += rng.gen_range(1..100);
                        stream.push(frag(clock, sid));
                    }
                    if epoch + 1 < epochs {
                        stream.push(barrier((epoch + 1) * 10_000, sid, epoch as u32 + 1));
                    }
                }
                stream.reverse();
                stream
            })
            .collect();

        let mut submitted = 0usize;
        let mut pending = Vec::new();
        while streams.iter().any(|s| !s.is_empty()) {
            let index = rng.gen_range(0..streams.len());
            if let Some(fragment) = streams[index].pop() {
                pending.push(fragment);
            }
            if rng.gen_bool(0.1) {
                submitted += pending.len();
                handler.add_fragments(&encode_fragments(&pending)).unwrap();
                pending.clear();
            }
        }
        submitted += pending.len();
        handler.add_fragments(&encode_fragments(&pending)).unwrap();
        handler.flush();

        let out = out.lock();
        assert_eq!(out.len(), submitted, "round {round}: every fragment emitted");
        let events = event_timestamps(&out);
        assert!(
            events.windows(2).all(|pair| pair[0] <= pair[1]),
            "round {round}: event output out of order: {events:?}"
        );
        assert_eq!(*complete.lock() as u64, epochs - 1, "round {round}");
        assert_eq!(*partial.lock(), 0, "round {round}");
    }
}

#[test]
fn duplicate_reported_once_per_repeat() {
    let mut handler = FragmentHandler::default();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    handler.add_duplicate_observer(Box::new(move |sid: u32, ts: u64| sink.lock().push((sid, ts))));

    handler
        .add_fragments(&encode_fragments(&[frag(100, 1), frag(110, 1), frag(110, 1)]))
        .unwrap();
    handler.flush();
    assert_eq!(*seen.lock(), vec![(1, 110)]);

    handler
        .add_fragments(&encode_fragments(&[frag(120, 1)]))
        .unwrap();
    handler.flush();
    assert_eq!(seen.lock().len(), 1);
}

#[test]
fn mixed_source_duplicate_counts() {
    let mut handler = FragmentHandler::default();
    handler.create_source_queue("crate1", 1);
    handler.create_source_queue("crate3", 3);
    let stats = DuplicateTimestampStatistics::default();
    handler.add_duplicate_observer(Box::new(stats.clone()));

    let source1 = [100, 110, 110, 110, 110, 120].map(|ts| frag(ts, 1));
    let source3 = [112, 112, 120, 125, 130, 132].map(|ts| frag(ts, 3));
    handler.add_fragments(&encode_fragments(&source1)).unwrap();
    handler.add_fragments(&encode_fragments(&source3)).unwrap();
    handler.flush();

    let snap = stats.snapshot();
    assert_eq!(snap.total, 4);
    assert_eq!(
        snap.by_source[&1],
        DuplicateSourceStats {
            count: 3,
            last_timestamp: 110
        }
    );
    assert_eq!(
        snap.by_source[&3],
        DuplicateSourceStats {
            count: 1,
            last_timestamp: 112
        }
    );
}

#[test]
fn late_data_reported_with_zero_build_window() {
    let mut handler = FragmentHandler::new(HandlerSettings {
        build_window: Duration::ZERO,
        ..HandlerSettings::default()
    });
    let late = Arc::new(Mutex::new(Vec::new()));
    let sink = late.clone();
    handler.add_data_late_observer(Box::new(move |fragment: &Fragment, newest: u64| {
        sink.lock().push((fragment.source_id(), fragment.timestamp(), newest));
    }));

    handler.add_fragments(&encode_fragments(&[frag(100, 1)])).unwrap();
    handler.flush_queues(false);
    handler.add_fragments(&encode_fragments(&[frag(50, 2)])).unwrap();
    handler.flush_queues(false);

    assert_eq!(*late.lock(), vec![(2, 50, 100)]);
}

#[test]
fn truncated_batch_fails_without_partial_fragment() {
    let mut handler = FragmentHandler::default();
    let out = collect_output(&mut handler);
    let flat = encode_fragments(&[frag(1, 1), frag(2, 2), frag(3, 1)]);

    let err = handler.add_fragments(&flat[..flat.len() - 3]).unwrap_err();
    match err {
        EvbError::SizeMismatch {
            offset,
            needed,
            available,
        } => {
            assert_eq!(offset, 2 * frag(0, 0).flat_size());
            assert_eq!(needed, frag(0, 0).flat_size());
            assert_eq!(available, needed - 3);
        }
        other => panic!("unexpected error: {other}"),
    }

    handler.flush();
    let emitted: Vec<u64> = out.lock().iter().map(Fragment::timestamp).collect();
    assert_eq!(emitted, vec![1, 2]);
}

#[test]
fn empty_flush_is_silent() {
    let mut handler = FragmentHandler::default();
    let counter = EventCounter::default();
    handler.add_event_observer(Box::new(counter.clone()));
    let barriers = Arc::new(Mutex::new(0));
    let b = barriers.clone();
    handler.add_barrier_observer(Box::new(move |_: &[(u32, u32)]| *b.lock() += 1));

    handler.flush();
    handler.flush_queues(false);

    assert_eq!(counter.snapshot().batches, 0);
    assert_eq!(*barriers.lock(), 0);
    assert_eq!(handler.oldest_timestamp(), NO_OLDEST_TIMESTAMP);
    assert_eq!(handler.newest_timestamp(), 0);
}

#[test]
fn clear_queues_resets_to_fresh_state() {
    let mut handler = FragmentHandler::default();
    handler.create_source_queue("crate1", 1);
    handler.create_source_queue("crate2", 2);
    handler
        .add_fragments(&encode_fragments(&[frag(500, 1), frag(600, 1)]))
        .unwrap();

    handler.clear_queues();
    let stats = handler.statistics();
    assert_eq!(stats.total_queued_fragments, 0);
    assert!(stats.queues.is_empty());
    assert!(stats.live_sources.is_empty());
    assert_eq!(stats.oldest_timestamp, NO_OLDEST_TIMESTAMP);

    // No late-data complaint: nothing has been emitted since the clear.
    let late = Arc::new(Mutex::new(0));
    let l = late.clone();
    handler.add_data_late_observer(Box::new(move |_: &Fragment, _: u64| *l.lock() += 1));
    let out = collect_output(&mut handler);

    handler
        .add_fragments(&encode_fragments(&[frag(10, 2)]))
        .unwrap();
    assert_eq!(out.lock().len(), 1);
    assert_eq!(*late.lock(), 0);
}

#[test]
fn removed_observer_stops_receiving() {
    let mut handler = FragmentHandler::default();
    let counter = EventCounter::default();
    let id = handler.add_event_observer(Box::new(counter.clone()));

    handler.add_fragments(&encode_fragments(&[frag(1, 1)])).unwrap();
    assert!(handler.remove_event_observer(id));
    handler.add_fragments(&encode_fragments(&[frag(2, 1)])).unwrap();

    assert_eq!(counter.snapshot().fragments, 1);
    assert!(!handler.remove_event_observer(id));
}

#[test]
#[tracing_test::traced_test]
fn large_output_jump_is_logged_but_emitted() {
    let mut handler = FragmentHandler::default();
    let out = collect_output(&mut handler);

    handler
        .add_fragments(&encode_fragments(&[frag(10, 1), frag(10 + 0x2_0000_0000, 1)]))
        .unwrap();

    assert_eq!(out.lock().len(), 2);
    assert!(logs_contain("Large timestamp jump"));
}
