//! Fuzz target for random fragment handler operation sequences.
//!
//! Tests:
//! - No operation sequence panics
//! - Queued byte accounting returns to zero after a complete flush
//! - Every queued fragment is delivered or dropped by a clear

#![no_main]

use arbitrary::Arbitrary;
use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use rust_evb::fragment::{encode_fragments, Fragment};
use rust_evb::handler::FragmentHandler;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Arbitrary)]
enum Op {
    /// Fragments for one source; timestamps are steps on that source's clock
    Add { source: u8, steps: Vec<(u8, u8)> },
    Flush,
    Opportunistic,
    Idle,
    CreateSource { source: u8 },
    FailSource { source: u8 },
    FailConnection { source: u8 },
    Revive { source: u8 },
    Clear,
    ResetTimestamps,
    SetXoff(u16),
    SetXon(u16),
}

fuzz_target!(|ops: Vec<Op>| {
    let mut handler = FragmentHandler::default();
    let delivered = Arc::new(AtomicUsize::new(0));
    let sink = delivered.clone();
    handler.add_event_observer(Box::new(move |batch: &[Fragment]| {
        sink.fetch_add(batch.len(), Ordering::Relaxed);
    }));
    let mut added = 0usize;

    let mut clocks = [0u64; 8];
    for op in ops {
        match op {
            Op::Add { source, steps } => {
                let sid = u32::from(source % 8);
                let fragments: Vec<Fragment> = steps
                    .into_iter()
                    .take(64)
                    .map(|(step, barrier)| {
                        clocks[sid as usize] += u64::from(step);
                        Fragment::new(
                            clocks[sid as usize],
                            sid,
                            u32::from(barrier % 4 == 0) * u32::from(barrier),
                            Bytes::from_static(b"fz"),
                        )
                    })
                    .collect();
                added += fragments.len();
                let _ = handler.add_fragments(&encode_fragments(&fragments));
            }
            Op::Flush => handler.flush(),
            Op::Opportunistic => handler.flush_queues(false),
            Op::Idle => {
                handler.idle_poll();
            }
            Op::CreateSource { source } => {
                let sid = u32::from(source % 8);
                handler.create_source_queue(&format!("conn{}", sid % 3), sid);
            }
            Op::FailSource { source } => handler.mark_source_failed(u32::from(source % 8)),
            Op::FailConnection { source } => {
                let _ = handler.mark_socket_failed(&format!("conn{}", source % 3));
            }
            Op::Revive { source } => {
                let _ = handler.revive_socket(&format!("conn{}", source % 3));
            }
            Op::Clear => {
                handler.clear_queues();
                clocks = [0; 8];
                added = 0;
                delivered.store(0, Ordering::Relaxed);
            }
            Op::ResetTimestamps => handler.reset_timestamps(),
            Op::SetXoff(bytes) => handler.set_xoff_threshold(usize::from(bytes)),
            Op::SetXon(bytes) => handler.set_xon_threshold(usize::from(bytes)),
        }
    }

    handler.flush();
    let stats = handler.statistics();
    assert_eq!(stats.total_queued_fragments, 0);
    assert_eq!(stats.queued_bytes, 0);
    assert_eq!(delivered.load(Ordering::Relaxed), added);
});
