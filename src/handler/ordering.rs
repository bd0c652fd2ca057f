//! Global timestamp ordering across source queues.
//!
//! `pop_oldest` only ever looks at queue heads. Each scan pops at most one
//! fragment (the first head whose timestamp equals the tracked oldest
//! timestamp) and, in the same pass, computes the oldest timestamp for the
//! next call. Same-timestamp heads are therefore released one per call in
//! source id order.

use super::source_queue::SourceQueue;
use super::{FragmentHandler, NO_OLDEST_TIMESTAMP};
use crate::fragment::Fragment;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Result of one scan over the queue heads.
///
/// `BarrierBlocked` and `Drifted` are told apart by the scan itself, so the
/// caller never has to infer "all heads are barriers" from the pending flag.
#[derive(Debug)]
enum Scan {
    /// A fragment matching the oldest timestamp was removed.
    Popped(Fragment),
    /// Ordinary heads exist but none matched; the oldest timestamp is stale.
    Drifted,
    /// Every non-empty queue is headed by a barrier.
    BarrierBlocked,
    /// Every queue is empty.
    Empty,
}

impl FragmentHandler {
    /// Pop the globally oldest ordinary fragment, if one can be released.
    ///
    /// Returns `None` when every queue is empty or every non-empty queue is
    /// waiting on a barrier. A stale oldest timestamp is recomputed and the
    /// scan retried once.
    pub(crate) fn pop_oldest(&mut self) -> Option<Fragment> {
        for attempt in 0..2 {
            match self.scan_heads() {
                Scan::Popped(fragment) => return Some(fragment),
                Scan::BarrierBlocked => {
                    trace!("All remaining heads are barriers");
                    return None;
                }
                Scan::Empty => {
                    self.oldest_timestamp = NO_OLDEST_TIMESTAMP;
                    return None;
                }
                Scan::Drifted => {
                    debug!(
                        attempt,
                        oldest = self.oldest_timestamp,
                        "Oldest timestamp matched no queue head; recomputing"
                    );
                    self.find_oldest();
                }
            }
        }
        None
    }

    fn scan_heads(&mut self) -> Scan {
        let oldest = self.oldest_timestamp;
        let mut next_oldest = NO_OLDEST_TIMESTAMP;
        let mut popped: Option<(u32, Fragment)> = None;
        let mut duplicate = false;
        let mut saw_barrier = false;
        let mut saw_event = false;

        for (&source_id, queue) in self.queues.iter_mut() {
            let Some(head) = queue.head() else {
                continue;
            };
            if head.fragment.is_barrier() {
                saw_barrier = true;
                continue;
            }
            saw_event = true;
            let timestamp = head.fragment.timestamp();

            if popped.is_none() && timestamp == oldest {
                let Some(entry) = queue.pop() else {
                    continue;
                };
                duplicate = queue.last_popped == Some(timestamp);
                queue.last_popped = Some(timestamp);

                match queue.head() {
                    Some(next) if next.fragment.is_barrier() => saw_barrier = true,
                    Some(next) => next_oldest = next_oldest.min(next.fragment.timestamp()),
                    None => {}
                }
                popped = Some((source_id, entry.fragment));
                continue;
            }

            if timestamp < oldest && oldest != NO_OLDEST_TIMESTAMP {
                warn!(
                    source_id,
                    timestamp,
                    oldest,
                    "Queue head is older than the global oldest timestamp"
                );
            }
            next_oldest = next_oldest.min(timestamp);
        }

        if saw_barrier {
            self.barrier_pending = true;
        }

        let Some((source_id, fragment)) = popped else {
            return if saw_event {
                Scan::Drifted
            } else if saw_barrier {
                Scan::BarrierBlocked
            } else {
                Scan::Empty
            };
        };

        let timestamp = fragment.timestamp();
        if let Some(previous) = self.most_recently_popped {
            let gap = timestamp.abs_diff(previous);
            if gap > self.settings.timestamp_jump_threshold {
                warn!(
                    source_id,
                    previous,
                    timestamp,
                    gap,
                    "Large timestamp jump in output; possible corruption or clock wrap"
                );
            }
        }
        if duplicate {
            debug!(source_id, timestamp, "Duplicate timestamp");
            self.observers.notify_duplicate(source_id, timestamp);
        }

        self.most_recently_popped = Some(timestamp);
        self.oldest_timestamp = next_oldest;
        Scan::Popped(fragment)
    }

    /// Recompute the oldest timestamp from the ordinary queue heads.
    pub(crate) fn find_oldest(&mut self) {
        self.oldest_timestamp = self
            .queues
            .values()
            .filter_map(SourceQueue::head_event_timestamp)
            .min()
            .unwrap_or(NO_OLDEST_TIMESTAMP);
    }

    /// Every live source has something queued.
    fn live_queues_have_data(&self) -> bool {
        self.live_sources
            .iter()
            .all(|sid| self.queues.get(sid).is_some_and(|q| !q.is_empty()))
    }

    /// Some ordinary head has waited at least the build window.
    fn stale_data_queued(&self, now: Instant) -> bool {
        let window = self.settings.build_window;
        self.queues.values().any(|queue| {
            queue.head().is_some_and(|entry| {
                !entry.fragment.is_barrier()
                    && now.saturating_duration_since(entry.arrival) >= window
            })
        })
    }

    /// Pop and deliver fragments under the flush policy, then resolve barriers.
    ///
    /// Opportunistic passes (`completely == false`) release data while every
    /// live source has something queued, then release whatever has aged past
    /// the build window. Complete passes drain until only barriers (or
    /// nothing) remain. In both modes a resolved barrier lets the pass keep
    /// going with the data queued behind it.
    pub(crate) fn flush_queues_at(&mut self, completely: bool, now: Instant) {
        loop {
            let mut batch = Vec::new();

            if completely {
                while let Some(fragment) = self.pop_oldest() {
                    batch.push(fragment);
                }
            } else {
                while self.live_queues_have_data() {
                    match self.pop_oldest() {
                        Some(fragment) => batch.push(fragment),
                        None => break,
                    }
                }
                while self.stale_data_queued(now) {
                    match self.pop_oldest() {
                        Some(fragment) => batch.push(fragment),
                        None => break,
                    }
                }
            }

            if !batch.is_empty() {
                debug!(
                    fragments = batch.len(),
                    first = batch.first().map(Fragment::timestamp),
                    last = batch.last().map(Fragment::timestamp),
                    completely,
                    "Emitting ordered batch"
                );
            }
            self.observe(batch);

            self.refresh_barrier_pending();
            let resolved = self.barrier_pending && self.check_barrier(completely, now);
            if !(resolved && !self.queues_empty()) {
                break;
            }
        }

        self.find_oldest();
    }
}
