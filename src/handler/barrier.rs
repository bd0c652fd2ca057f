//! Barrier classification and resolution.
//!
//! A barrier is pending while any queue is headed by a barrier fragment. It is
//! resolved as *complete* once every live source has one at its head, and as
//! *partial* when waiting any longer is pointless (a complete flush found the
//! other queues empty) or too slow (the oldest barrier outlived the barrier
//! timeout). Either way all barrier heads are popped, delivered to the event
//! observers as their own batch, and then reported to the barrier observers.

use super::source_queue::SourceQueue;
use super::FragmentHandler;
use crate::fragment::Fragment;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Outcome of collecting the barrier heads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BarrierSummary {
    /// `(source_id, barrier_type)` for every source that contributed.
    pub types_present: Vec<(u32, u32)>,
    /// Sources with no barrier at their queue head.
    pub missing_sources: Vec<u32>,
}

impl BarrierSummary {
    /// Whether all contributors agree on the barrier type.
    pub fn is_homogeneous(&self) -> bool {
        self.types_present
            .windows(2)
            .all(|pair| pair[0].1 == pair[1].1)
    }
}

impl FragmentHandler {
    /// Resolve the pending barrier if it is complete or cannot complete.
    ///
    /// Returns whether a barrier was generated.
    pub(crate) fn check_barrier(&mut self, completely: bool, now: Instant) -> bool {
        let complete = !self.live_sources.is_empty()
            && self
                .live_sources
                .iter()
                .all(|sid| self.queues.get(sid).is_some_and(SourceQueue::head_is_barrier));
        if complete {
            self.generate_complete_barrier();
            return true;
        }

        let others_exhausted = completely
            && self
                .queues
                .values()
                .filter(|queue| !queue.head_is_barrier())
                .all(SourceQueue::is_empty);

        let timeout = self.settings.barrier_timeout();
        let timed_out = self
            .oldest_barrier_arrival()
            .is_some_and(|arrival| now.saturating_duration_since(arrival) > timeout);

        if others_exhausted || timed_out {
            debug!(others_exhausted, timed_out, "Forcing partial barrier");
            self.generate_partial_barrier();
            return true;
        }
        false
    }

    fn oldest_barrier_arrival(&self) -> Option<Instant> {
        self.queues
            .values()
            .filter_map(SourceQueue::head)
            .filter(|entry| entry.fragment.is_barrier())
            .map(|entry| entry.arrival)
            .min()
    }

    /// Pop every barrier head, deliver the fragments, and report which sources
    /// contributed and which did not.
    fn collect_barrier(&mut self) -> BarrierSummary {
        let mut summary = BarrierSummary::default();
        let mut fragments: Vec<Fragment> = Vec::new();

        for (&source_id, queue) in self.queues.iter_mut() {
            if queue.head_is_barrier() {
                if let Some(entry) = queue.pop() {
                    summary
                        .types_present
                        .push((source_id, entry.fragment.barrier_type()));
                    fragments.push(entry.fragment);
                }
            } else {
                summary.missing_sources.push(source_id);
            }
        }

        self.observe(fragments);
        self.refresh_barrier_pending();
        self.find_oldest();
        summary
    }

    fn generate_complete_barrier(&mut self) {
        let summary = self.collect_barrier();
        if !summary.is_homogeneous() {
            debug!(types = ?summary.types_present, "Complete barrier with mixed types");
        }
        debug!(sources = summary.types_present.len(), "Complete barrier");
        self.observers
            .notify_complete_barrier(&summary.types_present);
    }

    pub(crate) fn generate_partial_barrier(&mut self) {
        let summary = self.collect_barrier();
        warn!(
            present = ?summary.types_present,
            missing = ?summary.missing_sources,
            "Partial barrier"
        );
        self.observers
            .notify_partial_barrier(&summary.types_present, &summary.missing_sources);
    }
}
