//! Per-source fragment FIFO.

use crate::fragment::Fragment;
use std::collections::VecDeque;
use tokio::time::Instant;

/// A fragment together with the wall-clock time it reached the builder.
#[derive(Debug, Clone)]
pub(crate) struct QueuedFragment {
    pub(crate) arrival: Instant,
    pub(crate) fragment: Fragment,
}

/// Arrival-ordered queue of fragments from one source.
///
/// A source is assumed to produce its own fragments in timestamp order, so only
/// the head is ever inspected by the ordering engine.
#[derive(Debug, Default)]
pub(crate) struct SourceQueue {
    fragments: VecDeque<QueuedFragment>,
    /// Highest timestamp assigned to a fragment of this source (last assigned,
    /// even if it went backwards). Backfills `NULL_TIMESTAMP` fragments.
    pub(crate) newest_timestamp: u64,
    /// Timestamp of the last ordinary fragment popped from this queue.
    pub(crate) last_popped: Option<u64>,
    bytes: usize,
}

impl SourceQueue {
    pub(crate) fn push(&mut self, arrival: Instant, fragment: Fragment) {
        self.bytes += fragment.flat_size();
        self.fragments.push_back(QueuedFragment { arrival, fragment });
    }

    pub(crate) fn pop(&mut self) -> Option<QueuedFragment> {
        let entry = self.fragments.pop_front()?;
        self.bytes -= entry.fragment.flat_size();
        Some(entry)
    }

    pub(crate) fn head(&self) -> Option<&QueuedFragment> {
        self.fragments.front()
    }

    /// Timestamp of the head, if the head is an ordinary (non-barrier) fragment.
    pub(crate) fn head_event_timestamp(&self) -> Option<u64> {
        self.head()
            .filter(|entry| !entry.fragment.is_barrier())
            .map(|entry| entry.fragment.timestamp())
    }

    pub(crate) fn head_is_barrier(&self) -> bool {
        self.head().is_some_and(|entry| entry.fragment.is_barrier())
    }

    pub(crate) fn len(&self) -> usize {
        self.fragments.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub(crate) fn bytes(&self) -> usize {
        self.bytes
    }

    pub(crate) fn reset_timestamps(&mut self) {
        self.newest_timestamp = 0;
        self.last_popped = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn frag(ts: u64, barrier: u32, payload: &'static [u8]) -> Fragment {
        Fragment::new(ts, 1, barrier, Bytes::from_static(payload))
    }

    #[test]
    fn pops_in_arrival_order_and_tracks_bytes() {
        let now = Instant::now();
        let mut queue = SourceQueue::default();
        queue.push(now, frag(30, 0, b"aa"));
        queue.push(now, frag(10, 0, b"bbbb"));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.bytes(), 2 * crate::fragment::HEADER_SIZE + 6);

        assert_eq!(queue.pop().map(|e| e.fragment.timestamp()), Some(30));
        assert_eq!(queue.bytes(), crate::fragment::HEADER_SIZE + 4);
        assert_eq!(queue.pop().map(|e| e.fragment.timestamp()), Some(10));
        assert!(queue.is_empty());
        assert_eq!(queue.bytes(), 0);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn barrier_head_has_no_event_timestamp() {
        let mut queue = SourceQueue::default();
        queue.push(Instant::now(), frag(5, 2, b""));

        assert!(queue.head_is_barrier());
        assert_eq!(queue.head_event_timestamp(), None);
    }
}
