//! Statistics snapshots and statistics-collecting observers.
//!
//! [`HandlerStatistics`] is what [`FragmentHandler::statistics`] returns: the
//! ordering trackers plus one [`QueueStatistics`] per source queue.
//!
//! The collectors below accumulate anomaly counts by registering as ordinary
//! observers. Each is a cheap-clone handle; keep one clone, box another into the
//! handler, and call `snapshot()` whenever a report is needed:
//!
//! ```
//! use rust_evb::handler::FragmentHandler;
//! use rust_evb::statistics::DuplicateTimestampStatistics;
//!
//! let mut handler = FragmentHandler::default();
//! let duplicates = DuplicateTimestampStatistics::default();
//! handler.add_duplicate_observer(Box::new(duplicates.clone()));
//! assert_eq!(duplicates.snapshot().total, 0);
//! ```
//!
//! [`FragmentHandler::statistics`]: crate::handler::FragmentHandler::statistics

use crate::fragment::Fragment;
use crate::observers::{
    BarrierObserver, DataLateObserver, DuplicateTimestampObserver, EventObserver,
    NonMonotonicTimestampObserver, PartialBarrierObserver,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Per-source queue state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatistics {
    /// Source the queue belongs to.
    pub source_id: u32,
    /// Fragments waiting in the queue.
    pub depth: usize,
    /// Timestamp of the queue head, if any.
    pub oldest_timestamp: Option<u64>,
    /// Flat bytes waiting in the queue.
    pub bytes: usize,
    /// Whether the source is expected to contribute.
    pub live: bool,
}

/// Snapshot of a fragment handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandlerStatistics {
    /// Next timestamp eligible for output (`u64::MAX` when none).
    pub oldest_timestamp: u64,
    /// Highest timestamp seen (0 when none).
    pub newest_timestamp: u64,
    /// Fragments queued across all sources.
    pub total_queued_fragments: usize,
    /// Flat bytes queued across all sources.
    pub queued_bytes: usize,
    /// Whether Xoff is currently asserted.
    pub xoff_asserted: bool,
    /// Whether some queue is headed by a barrier.
    pub barrier_pending: bool,
    /// Sources currently expected to contribute.
    pub live_sources: Vec<u32>,
    /// Connections marked failed.
    pub dead_sockets: Vec<String>,
    /// One entry per source queue, ordered by source id.
    pub queues: Vec<QueueStatistics>,
}

// =============================================================================
// Duplicate timestamps
// =============================================================================

/// Duplicate counts for one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DuplicateSourceStats {
    /// Duplicates seen from this source.
    pub count: u64,
    /// Most recent duplicated timestamp.
    pub last_timestamp: u64,
}

/// Snapshot of [`DuplicateTimestampStatistics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DuplicateTimestampSnapshot {
    /// Duplicates across every source.
    pub total: u64,
    /// Per-source breakdown.
    pub by_source: BTreeMap<u32, DuplicateSourceStats>,
}

/// Counts duplicate-timestamp notifications.
#[derive(Debug, Clone, Default)]
pub struct DuplicateTimestampStatistics {
    inner: Arc<Mutex<DuplicateTimestampSnapshot>>,
}

impl DuplicateTimestampStatistics {
    /// Current counts.
    pub fn snapshot(&self) -> DuplicateTimestampSnapshot {
        self.inner.lock().clone()
    }

    /// Zero every count.
    pub fn clear(&self) {
        *self.inner.lock() = DuplicateTimestampSnapshot::default();
    }
}

impl DuplicateTimestampObserver for DuplicateTimestampStatistics {
    fn on_duplicate_timestamp(&mut self, source_id: u32, timestamp: u64) {
        let mut stats = self.inner.lock();
        stats.total += 1;
        let entry = stats
            .by_source
            .entry(source_id)
            .or_insert(DuplicateSourceStats {
                count: 0,
                last_timestamp: timestamp,
            });
        entry.count += 1;
        entry.last_timestamp = timestamp;
    }
}

// =============================================================================
// Barriers
// =============================================================================

/// Snapshot of [`BarrierStatistics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BarrierSnapshot {
    /// Complete barriers seen.
    pub complete: u64,
    /// Complete barriers whose contributors disagreed on the type.
    pub heterogeneous: u64,
    /// Contributions per barrier type, over complete barriers.
    pub complete_by_type: BTreeMap<u32, u64>,
    /// Partial barriers seen.
    pub partial: u64,
    /// How often each source was missing from a partial barrier.
    pub missing_by_source: BTreeMap<u32, u64>,
}

/// Counts complete and partial barriers.
///
/// Register the same handle as both a barrier and a partial-barrier observer.
#[derive(Debug, Clone, Default)]
pub struct BarrierStatistics {
    inner: Arc<Mutex<BarrierSnapshot>>,
}

impl BarrierStatistics {
    /// Current counts.
    pub fn snapshot(&self) -> BarrierSnapshot {
        self.inner.lock().clone()
    }
}

impl BarrierObserver for BarrierStatistics {
    fn on_complete_barrier(&mut self, types_present: &[(u32, u32)]) {
        let mut stats = self.inner.lock();
        stats.complete += 1;
        if types_present.windows(2).any(|pair| pair[0].1 != pair[1].1) {
            stats.heterogeneous += 1;
        }
        for &(_, barrier_type) in types_present {
            *stats.complete_by_type.entry(barrier_type).or_default() += 1;
        }
    }
}

impl PartialBarrierObserver for BarrierStatistics {
    fn on_partial_barrier(&mut self, _types_present: &[(u32, u32)], missing_sources: &[u32]) {
        let mut stats = self.inner.lock();
        stats.partial += 1;
        for &source_id in missing_sources {
            *stats.missing_by_source.entry(source_id).or_default() += 1;
        }
    }
}

// =============================================================================
// Late data
// =============================================================================

/// Snapshot of [`DataLateStatistics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DataLateSnapshot {
    /// Late fragments seen.
    pub count: u64,
    /// Largest distance behind already-emitted data, in ticks.
    pub worst_delta: u64,
    /// Late fragments per source.
    pub by_source: BTreeMap<u32, u64>,
}

/// Counts late fragments.
#[derive(Debug, Clone, Default)]
pub struct DataLateStatistics {
    inner: Arc<Mutex<DataLateSnapshot>>,
}

impl DataLateStatistics {
    /// Current counts.
    pub fn snapshot(&self) -> DataLateSnapshot {
        self.inner.lock().clone()
    }
}

impl DataLateObserver for DataLateStatistics {
    fn on_data_late(&mut self, fragment: &Fragment, newest_output: u64) {
        let mut stats = self.inner.lock();
        stats.count += 1;
        stats.worst_delta = stats
            .worst_delta
            .max(newest_output.saturating_sub(fragment.timestamp()));
        *stats.by_source.entry(fragment.source_id()).or_default() += 1;
    }
}

// =============================================================================
// Out-of-order (non-monotonic) sources
// =============================================================================

/// Non-monotonic counts for one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OutOfOrderSourceStats {
    /// Backwards steps seen from this source.
    pub count: u64,
    /// Timestamp before the most recent backwards step.
    pub last_prior: u64,
    /// Timestamp of the most recent backwards step.
    pub last_current: u64,
}

/// Snapshot of [`OutOfOrderStatistics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutOfOrderSnapshot {
    /// Backwards steps across every source.
    pub total: u64,
    /// Per-source breakdown.
    pub by_source: BTreeMap<u32, OutOfOrderSourceStats>,
}

/// Counts sources whose timestamps went backwards.
#[derive(Debug, Clone, Default)]
pub struct OutOfOrderStatistics {
    inner: Arc<Mutex<OutOfOrderSnapshot>>,
}

impl OutOfOrderStatistics {
    /// Current counts.
    pub fn snapshot(&self) -> OutOfOrderSnapshot {
        self.inner.lock().clone()
    }
}

impl NonMonotonicTimestampObserver for OutOfOrderStatistics {
    fn on_non_monotonic(&mut self, source_id: u32, prior: u64, current: u64) {
        let mut stats = self.inner.lock();
        stats.total += 1;
        let entry = stats
            .by_source
            .entry(source_id)
            .or_insert(OutOfOrderSourceStats {
                count: 0,
                last_prior: prior,
                last_current: current,
            });
        entry.count += 1;
        entry.last_prior = prior;
        entry.last_current = current;
    }
}

// =============================================================================
// Output volume
// =============================================================================

/// Snapshot of [`EventCounter`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EventCounts {
    /// Batches delivered.
    pub batches: u64,
    /// Fragments delivered.
    pub fragments: u64,
    /// Payload bytes delivered.
    pub payload_bytes: u64,
    /// Barrier fragments among them.
    pub barrier_fragments: u64,
    /// Highest timestamp delivered.
    pub last_timestamp: Option<u64>,
}

/// Counts what the event observers were given.
#[derive(Debug, Clone, Default)]
pub struct EventCounter {
    inner: Arc<Mutex<EventCounts>>,
}

impl EventCounter {
    /// Current counts.
    pub fn snapshot(&self) -> EventCounts {
        *self.inner.lock()
    }
}

impl EventObserver for EventCounter {
    fn on_events(&mut self, batch: &[Fragment]) {
        let mut counts = self.inner.lock();
        counts.batches += 1;
        for fragment in batch {
            counts.fragments += 1;
            counts.payload_bytes += fragment.payload().len() as u64;
            if fragment.is_barrier() {
                counts.barrier_fragments += 1;
            }
            counts.last_timestamp = Some(
                counts
                    .last_timestamp
                    .map_or(fragment.timestamp(), |ts| ts.max(fragment.timestamp())),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn duplicate_statistics_accumulate_per_source() {
        let mut stats = DuplicateTimestampStatistics::default();
        let reader = stats.clone();

        stats.on_duplicate_timestamp(1, 110);
        stats.on_duplicate_timestamp(1, 110);
        stats.on_duplicate_timestamp(3, 112);

        let snap = reader.snapshot();
        assert_eq!(snap.total, 3);
        assert_eq!(
            snap.by_source[&1],
            DuplicateSourceStats {
                count: 2,
                last_timestamp: 110
            }
        );
        assert_eq!(snap.by_source[&3].count, 1);

        reader.clear();
        assert_eq!(stats.snapshot().total, 0);
    }

    #[test]
    fn barrier_statistics_track_types_and_missing_sources() {
        let mut stats = BarrierStatistics::default();
        stats.on_complete_barrier(&[(1, 1), (2, 1)]);
        stats.on_complete_barrier(&[(1, 1), (2, 2)]);
        stats.on_partial_barrier(&[(1, 1)], &[2, 3]);
        stats.on_partial_barrier(&[(1, 1), (2, 1)], &[3]);

        let snap = stats.snapshot();
        assert_eq!(snap.complete, 2);
        assert_eq!(snap.heterogeneous, 1);
        assert_eq!(snap.complete_by_type[&1], 3);
        assert_eq!(snap.complete_by_type[&2], 1);
        assert_eq!(snap.partial, 2);
        assert_eq!(snap.missing_by_source[&2], 1);
        assert_eq!(snap.missing_by_source[&3], 2);
    }

    #[test]
    fn data_late_statistics_keep_worst_delta() {
        let mut stats = DataLateStatistics::default();
        stats.on_data_late(&Fragment::new(90, 2, 0, Bytes::new()), 100);
        stats.on_data_late(&Fragment::new(40, 2, 0, Bytes::new()), 100);
        stats.on_data_late(&Fragment::new(99, 5, 0, Bytes::new()), 100);

        let snap = stats.snapshot();
        assert_eq!(snap.count, 3);
        assert_eq!(snap.worst_delta, 60);
        assert_eq!(snap.by_source[&2], 2);
        assert_eq!(snap.by_source[&5], 1);
    }

    #[test]
    fn event_counter_sums_batches() {
        let mut counter = EventCounter::default();
        counter.on_events(&[
            Fragment::new(5, 1, 0, Bytes::from_static(b"abc")),
            Fragment::new(7, 2, 1, Bytes::new()),
        ]);
        counter.on_events(&[Fragment::new(6, 1, 0, Bytes::from_static(b"z"))]);

        let counts = counter.snapshot();
        assert_eq!(counts.batches, 2);
        assert_eq!(counts.fragments, 3);
        assert_eq!(counts.payload_bytes, 4);
        assert_eq!(counts.barrier_fragments, 1);
        assert_eq!(counts.last_timestamp, Some(7));
    }
}
