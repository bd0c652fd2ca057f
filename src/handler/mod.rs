//! The fragment handler: per-source queues, global timestamp ordering and
//! barrier synchronization.
//!
//! A [`FragmentHandler`] is the single owner of every queued fragment. Readout
//! code feeds it flattened fragment batches through
//! [`add_fragments`](FragmentHandler::add_fragments); after each batch the
//! handler runs an opportunistic flush that pops fragments in global timestamp
//! order and hands each ordered batch to the registered event observers.
//!
//! # Ordering policy
//!
//! Each source keeps its own FIFO. A fragment is released only when either
//! every live source has data queued (so the oldest head is known to be the
//! global minimum), or it has waited at least the build window. A complete
//! flush ([`flush`](FragmentHandler::flush)) ignores both conditions and drains
//! everything.
//!
//! # Barriers
//!
//! A fragment with a non-zero barrier type blocks its own queue until every
//! live source has a barrier at its head (complete barrier), a complete flush
//! finds the remaining sources empty, or the oldest barrier has waited longer
//! than `barrier_timeout_factor` build windows (partial barrier).
//!
//! # Concurrency
//!
//! The handler is a plain synchronous value. Share it the way
//! [`crate::service`] does: one task owns it and everything else talks to that
//! task.

mod barrier;
mod flow_control;
mod ordering;
mod source_queue;

pub use barrier::BarrierSummary;

use crate::error::{EvbError, EvbResult};
use crate::fragment::{FlatFragments, Fragment, NULL_TIMESTAMP};
use crate::observers::{
    BarrierObserver, DataLateObserver, DuplicateTimestampObserver, EventObserver,
    FlowControlObserver, NonMonotonicTimestampObserver, ObserverId, ObserverRegistry,
    PartialBarrierObserver,
};
use crate::statistics::{HandlerStatistics, QueueStatistics};
use flow_control::{FlowController, FlowTransition};
use source_queue::SourceQueue;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

// =============================================================================
// Policy Defaults
// =============================================================================

/// Value of the global oldest timestamp when nothing is eligible for output.
pub const NO_OLDEST_TIMESTAMP: u64 = u64::MAX;

/// Default time data is held so slower sources can catch up (20 seconds).
pub const DEFAULT_BUILD_WINDOW: Duration = Duration::from_secs(20);

/// Default multiple of the build window a barrier may wait before it is
/// resolved as partial.
pub const DEFAULT_BARRIER_TIMEOUT_FACTOR: u32 = 4;

/// Default gap between consecutive output timestamps that is logged as a
/// likely corruption or clock wrap.
pub const DEFAULT_TIMESTAMP_JUMP_THRESHOLD: u64 = 0x1_0000_0000;

/// Default queued byte count above which Xoff is asserted (32 MiB).
pub const DEFAULT_XOFF_THRESHOLD: usize = 32 * 1024 * 1024;

/// Default queued byte count at or below which Xon is asserted (16 MiB).
pub const DEFAULT_XON_THRESHOLD: usize = 16 * 1024 * 1024;

/// Tunable policy knobs for a [`FragmentHandler`].
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerSettings {
    /// How long data is held waiting for other sources.
    pub build_window: Duration,
    /// Barrier timeout expressed in build windows.
    pub barrier_timeout_factor: u32,
    /// Output timestamp gap reported as suspicious.
    pub timestamp_jump_threshold: u64,
    /// Xon threshold in queued bytes.
    pub xon_threshold: usize,
    /// Xoff threshold in queued bytes.
    pub xoff_threshold: usize,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            build_window: DEFAULT_BUILD_WINDOW,
            barrier_timeout_factor: DEFAULT_BARRIER_TIMEOUT_FACTOR,
            timestamp_jump_threshold: DEFAULT_TIMESTAMP_JUMP_THRESHOLD,
            xon_threshold: DEFAULT_XON_THRESHOLD,
            xoff_threshold: DEFAULT_XOFF_THRESHOLD,
        }
    }
}

impl HandlerSettings {
    /// Time the oldest barrier may wait before a partial barrier is forced.
    pub fn barrier_timeout(&self) -> Duration {
        self.build_window * self.barrier_timeout_factor
    }
}

/// Orders fragments from many sources and resolves synchronization barriers.
#[derive(Debug)]
pub struct FragmentHandler {
    settings: HandlerSettings,
    /// Keyed by source id; iteration order is the scan order of `pop_oldest`.
    queues: BTreeMap<u32, SourceQueue>,
    live_sources: BTreeSet<u32>,
    socket_sources: HashMap<String, Vec<u32>>,
    dead_sockets: HashMap<String, Vec<u32>>,
    oldest_timestamp: u64,
    newest_timestamp: u64,
    most_recently_popped: Option<u64>,
    barrier_pending: bool,
    flow: FlowController,
    fragments_this_period: u64,
    observers: ObserverRegistry,
}

impl Default for FragmentHandler {
    fn default() -> Self {
        Self::new(HandlerSettings::default())
    }
}

impl FragmentHandler {
    /// Create an empty handler.
    pub fn new(settings: HandlerSettings) -> Self {
        if settings.xon_threshold > settings.xoff_threshold {
            warn!(
                xon = settings.xon_threshold,
                xoff = settings.xoff_threshold,
                "Xon threshold above Xoff threshold; flow control will toggle rapidly"
            );
        }
        let flow = FlowController::new(settings.xon_threshold, settings.xoff_threshold);
        Self {
            settings,
            queues: BTreeMap::new(),
            live_sources: BTreeSet::new(),
            socket_sources: HashMap::new(),
            dead_sockets: HashMap::new(),
            oldest_timestamp: NO_OLDEST_TIMESTAMP,
            newest_timestamp: 0,
            most_recently_popped: None,
            barrier_pending: false,
            flow,
            fragments_this_period: 0,
            observers: ObserverRegistry::default(),
        }
    }

    /// Current policy settings.
    pub fn settings(&self) -> &HandlerSettings {
        &self.settings
    }

    // -------------------------------------------------------------------------
    // Ingestion
    // -------------------------------------------------------------------------

    /// Queue every flat fragment in `buf`, then run an opportunistic flush.
    ///
    /// On a size mismatch the call fails; fragments decoded before the bad one
    /// stay queued and no flush runs.
    pub fn add_fragments(&mut self, buf: &[u8]) -> EvbResult<()> {
        self.add_fragments_at(buf, Instant::now())
    }

    pub(crate) fn add_fragments_at(&mut self, buf: &[u8], now: Instant) -> EvbResult<()> {
        if buf.is_empty() {
            return Ok(());
        }

        for fragment in FlatFragments::new(buf) {
            let fragment = fragment.inspect_err(|e| {
                warn!(error = %e, batch_bytes = buf.len(), "Rejecting malformed fragment batch");
            })?;
            self.add_fragment_at(fragment, now);
        }

        self.flush_queues_at(false, now);
        Ok(())
    }

    /// Queue a single fragment without flushing.
    pub fn add_fragment(&mut self, fragment: Fragment) {
        self.add_fragment_at(fragment, Instant::now());
    }

    pub(crate) fn add_fragment_at(&mut self, mut fragment: Fragment, now: Instant) {
        let source_id = fragment.source_id();
        let queue = self.queues.entry(source_id).or_default();

        if fragment.timestamp() == NULL_TIMESTAMP {
            fragment.set_timestamp(queue.newest_timestamp);
        }
        let timestamp = fragment.timestamp();

        // Tracked, not corrected: the newest timestamp follows the input even
        // when it goes backwards.
        let prior = queue.newest_timestamp;
        queue.newest_timestamp = timestamp;
        if timestamp < prior {
            debug!(source_id, prior, timestamp, "Non-monotonic timestamp");
            self.observers
                .notify_non_monotonic(source_id, prior, timestamp);
        }

        if let Some(popped) = self.most_recently_popped {
            if timestamp < popped {
                warn!(
                    source_id,
                    timestamp,
                    most_recently_popped = popped,
                    "Data late: fragment precedes already emitted data"
                );
                self.observers.notify_data_late(&fragment, popped);
            }
        }

        if !fragment.is_barrier() && timestamp < self.oldest_timestamp {
            self.oldest_timestamp = timestamp;
        }
        if timestamp > self.newest_timestamp {
            self.newest_timestamp = timestamp;
        }

        self.live_sources.insert(source_id);
        let bytes = fragment.flat_size();
        if let Some(queue) = self.queues.get_mut(&source_id) {
            queue.push(now, fragment);
        }
        self.fragments_this_period += 1;

        if let Some(transition) = self.flow.enqueued(bytes) {
            self.announce_flow(transition);
        }
    }

    /// Flush if no fragments arrived since the previous poll.
    ///
    /// Driven by the idle timer so that sparse traffic is not held forever.
    /// Returns whether a flush ran.
    pub fn idle_poll(&mut self) -> bool {
        self.idle_poll_at(Instant::now())
    }

    pub(crate) fn idle_poll_at(&mut self, now: Instant) -> bool {
        let idle = self.fragments_this_period == 0;
        self.fragments_this_period = 0;
        if idle {
            self.flush_queues_at(false, now);
        }
        idle
    }

    /// Drain every queue and reset the oldest/newest trackers.
    pub fn flush(&mut self) {
        self.flush_queues_at(true, Instant::now());
        self.oldest_timestamp = NO_OLDEST_TIMESTAMP;
        self.newest_timestamp = 0;
    }

    /// Run one flush pass; see the module docs for the policy.
    pub fn flush_queues(&mut self, completely: bool) {
        self.flush_queues_at(completely, Instant::now());
    }

    // -------------------------------------------------------------------------
    // Configuration
    // -------------------------------------------------------------------------

    /// Set the build window.
    pub fn set_build_window(&mut self, window: Duration) {
        self.settings.build_window = window;
    }

    /// The build window.
    pub fn build_window(&self) -> Duration {
        self.settings.build_window
    }

    /// Set the Xoff threshold in queued bytes.
    pub fn set_xoff_threshold(&mut self, bytes: usize) {
        self.settings.xoff_threshold = bytes;
        self.flow.xoff_threshold = bytes;
        self.warn_on_inverted_thresholds();
    }

    /// Set the Xon threshold in queued bytes.
    pub fn set_xon_threshold(&mut self, bytes: usize) {
        self.settings.xon_threshold = bytes;
        self.flow.xon_threshold = bytes;
        self.warn_on_inverted_thresholds();
    }

    fn warn_on_inverted_thresholds(&self) {
        if self.flow.xon_threshold > self.flow.xoff_threshold {
            warn!(
                xon = self.flow.xon_threshold,
                xoff = self.flow.xoff_threshold,
                "Xon threshold above Xoff threshold; flow control will toggle rapidly"
            );
        }
    }

    // -------------------------------------------------------------------------
    // Source lifecycle
    // -------------------------------------------------------------------------

    /// Create the queue for `source_id` and associate it with a connection.
    pub fn create_source_queue(&mut self, connection: &str, source_id: u32) {
        self.queues.entry(source_id).or_default();
        let sources = self.socket_sources.entry(connection.to_string()).or_default();
        if !sources.contains(&source_id) {
            sources.push(source_id);
        }
        self.live_sources.insert(source_id);
        debug!(connection, source_id, "Source queue registered");
    }

    /// Stop expecting data (and barriers) from `source_id`.
    ///
    /// If a barrier is pending and every remaining live source already holds
    /// one, the barrier is resolved as partial right away.
    pub fn mark_source_failed(&mut self, source_id: u32) {
        if self.live_sources.remove(&source_id) {
            info!(source_id, "Source marked failed");
        }

        self.refresh_barrier_pending();
        if self.barrier_pending {
            let present = self
                .live_sources
                .iter()
                .filter(|&sid| self.queues.get(sid).is_some_and(SourceQueue::head_is_barrier))
                .count();
            if present == self.live_sources.len() {
                self.generate_partial_barrier();
            }
        }
        self.find_oldest();
    }

    /// Mark every source carried by `connection` failed.
    pub fn mark_socket_failed(&mut self, connection: &str) -> EvbResult<()> {
        if self.dead_sockets.contains_key(connection) {
            debug!(connection, "Connection already marked failed");
            return Ok(());
        }
        let sources = self
            .socket_sources
            .remove(connection)
            .ok_or_else(|| EvbError::UnknownConnection(connection.to_string()))?;

        info!(connection, ?sources, "Connection marked failed");
        for &source_id in &sources {
            self.mark_source_failed(source_id);
        }
        self.dead_sockets.insert(connection.to_string(), sources);
        Ok(())
    }

    /// Bring the sources of a failed connection back to life.
    pub fn revive_socket(&mut self, connection: &str) -> EvbResult<()> {
        let sources = self
            .dead_sockets
            .remove(connection)
            .ok_or_else(|| EvbError::ConnectionNotFailed(connection.to_string()))?;

        info!(connection, ?sources, "Connection revived");
        self.live_sources.extend(sources.iter().copied());
        self.socket_sources.insert(connection.to_string(), sources);
        self.find_oldest();
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Administrative resets
    // -------------------------------------------------------------------------

    /// Discard every queue, source registration and timestamp.
    ///
    /// Observers and settings are kept. Queued fragments are dropped without
    /// being delivered.
    pub fn clear_queues(&mut self) {
        let dropped: usize = self.queues.values().map(SourceQueue::len).sum();
        info!(dropped_fragments = dropped, "Clearing all source queues");

        self.queues.clear();
        self.live_sources.clear();
        self.socket_sources.clear();
        self.dead_sockets.clear();
        self.oldest_timestamp = NO_OLDEST_TIMESTAMP;
        self.newest_timestamp = 0;
        self.most_recently_popped = None;
        self.barrier_pending = false;
        self.fragments_this_period = 0;
        if let Some(transition) = self.flow.reset() {
            self.announce_flow(transition);
        }
    }

    /// Forget every timestamp without touching queued data.
    pub fn reset_timestamps(&mut self) {
        self.oldest_timestamp = NO_OLDEST_TIMESTAMP;
        self.newest_timestamp = 0;
        self.most_recently_popped = None;
        for queue in self.queues.values_mut() {
            queue.reset_timestamps();
        }
        self.find_oldest();
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    /// Snapshot of the ordering state and every queue.
    pub fn statistics(&self) -> HandlerStatistics {
        let queues: Vec<QueueStatistics> = self
            .queues
            .iter()
            .map(|(&source_id, queue)| QueueStatistics {
                source_id,
                depth: queue.len(),
                oldest_timestamp: queue.head().map(|entry| entry.fragment.timestamp()),
                bytes: queue.bytes(),
                live: self.live_sources.contains(&source_id),
            })
            .collect();

        let mut dead_sockets: Vec<String> = self.dead_sockets.keys().cloned().collect();
        dead_sockets.sort();

        HandlerStatistics {
            oldest_timestamp: self.oldest_timestamp,
            newest_timestamp: self.newest_timestamp,
            total_queued_fragments: queues.iter().map(|q| q.depth).sum(),
            queued_bytes: self.flow.queued_bytes(),
            xoff_asserted: self.flow.xoff_asserted(),
            barrier_pending: self.barrier_pending,
            live_sources: self.live_sources.iter().copied().collect(),
            dead_sockets,
            queues,
        }
    }

    /// Timestamp of the next fragment eligible for output.
    pub fn oldest_timestamp(&self) -> u64 {
        self.oldest_timestamp
    }

    /// Highest timestamp seen from any source.
    pub fn newest_timestamp(&self) -> u64 {
        self.newest_timestamp
    }

    /// Timestamp of the most recently emitted ordinary fragment.
    pub fn most_recently_popped(&self) -> Option<u64> {
        self.most_recently_popped
    }

    /// Mutable access to every observer list.
    pub fn observers_mut(&mut self) -> &mut ObserverRegistry {
        &mut self.observers
    }

    // -------------------------------------------------------------------------
    // Observer registration
    // -------------------------------------------------------------------------

    /// Register an output observer.
    pub fn add_event_observer(&mut self, observer: Box<dyn EventObserver>) -> ObserverId {
        self.observers.add_event_observer(observer)
    }

    /// Remove an output observer; unknown ids are ignored.
    pub fn remove_event_observer(&mut self, id: ObserverId) -> bool {
        self.observers.remove_event_observer(id)
    }

    /// Register a data-late observer.
    pub fn add_data_late_observer(&mut self, observer: Box<dyn DataLateObserver>) -> ObserverId {
        self.observers.add_data_late_observer(observer)
    }

    /// Remove a data-late observer; unknown ids are ignored.
    pub fn remove_data_late_observer(&mut self, id: ObserverId) -> bool {
        self.observers.remove_data_late_observer(id)
    }

    /// Register a duplicate-timestamp observer.
    pub fn add_duplicate_observer(
        &mut self,
        observer: Box<dyn DuplicateTimestampObserver>,
    ) -> ObserverId {
        self.observers.add_duplicate_observer(observer)
    }

    /// Remove a duplicate-timestamp observer; unknown ids are ignored.
    pub fn remove_duplicate_observer(&mut self, id: ObserverId) -> bool {
        self.observers.remove_duplicate_observer(id)
    }

    /// Register a non-monotonic timestamp observer.
    pub fn add_non_monotonic_observer(
        &mut self,
        observer: Box<dyn NonMonotonicTimestampObserver>,
    ) -> ObserverId {
        self.observers.add_non_monotonic_observer(observer)
    }

    /// Remove a non-monotonic timestamp observer; unknown ids are ignored.
    pub fn remove_non_monotonic_observer(&mut self, id: ObserverId) -> bool {
        self.observers.remove_non_monotonic_observer(id)
    }

    /// Register a complete-barrier observer.
    pub fn add_barrier_observer(&mut self, observer: Box<dyn BarrierObserver>) -> ObserverId {
        self.observers.add_barrier_observer(observer)
    }

    /// Remove a complete-barrier observer; unknown ids are ignored.
    pub fn remove_barrier_observer(&mut self, id: ObserverId) -> bool {
        self.observers.remove_barrier_observer(id)
    }

    /// Register a partial-barrier observer.
    pub fn add_partial_barrier_observer(
        &mut self,
        observer: Box<dyn PartialBarrierObserver>,
    ) -> ObserverId {
        self.observers.add_partial_barrier_observer(observer)
    }

    /// Remove a partial-barrier observer; unknown ids are ignored.
    pub fn remove_partial_barrier_observer(&mut self, id: ObserverId) -> bool {
        self.observers.remove_partial_barrier_observer(id)
    }

    /// Register a flow-control observer.
    pub fn add_flow_control_observer(
        &mut self,
        observer: Box<dyn FlowControlObserver>,
    ) -> ObserverId {
        self.observers.add_flow_control_observer(observer)
    }

    /// Remove a flow-control observer; unknown ids are ignored.
    pub fn remove_flow_control_observer(&mut self, id: ObserverId) -> bool {
        self.observers.remove_flow_control_observer(id)
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    fn announce_flow(&mut self, transition: FlowTransition) {
        match transition {
            FlowTransition::Xoff => {
                warn!(
                    queued_bytes = self.flow.queued_bytes(),
                    threshold = self.flow.xoff_threshold,
                    "Xoff: queued data above threshold"
                );
                self.observers.notify_xoff();
            }
            FlowTransition::Xon => {
                info!(
                    queued_bytes = self.flow.queued_bytes(),
                    threshold = self.flow.xon_threshold,
                    "Xon: queued data drained"
                );
                self.observers.notify_xon();
            }
        }
    }

    /// Deliver an ordered batch, release its bytes and re-evaluate Xon.
    fn observe(&mut self, batch: Vec<Fragment>) {
        if batch.is_empty() {
            return;
        }
        self.observers.notify_events(&batch);
        let released: usize = batch.iter().map(Fragment::flat_size).sum();
        drop(batch);

        self.flow.dequeued(released);
        if let Some(transition) = self.flow.check_xon() {
            self.announce_flow(transition);
        }
    }

    fn refresh_barrier_pending(&mut self) {
        self.barrier_pending = self.queues.values().any(SourceQueue::head_is_barrier);
    }

    fn queues_empty(&self) -> bool {
        self.queues.values().all(SourceQueue::is_empty)
    }
}
