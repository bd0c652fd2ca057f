//! Observer traits and the registry the fragment handler notifies.
//!
//! Every kind of notification has its own trait and its own ordered list.
//! Lists are invoked synchronously and exhaustively, in registration order.
//! Registration returns an [`ObserverId`]; removing an id that is not (or no
//! longer) registered is a silent no-op that returns `false`.
//!
//! Observers receive borrowed fragments. The handler drops popped fragments as
//! soon as the observer loop returns, so an observer that needs to keep data
//! must clone it (cheap: payloads are reference counted).
//!
//! Closures implement the single-method traits, which keeps ad-hoc observers short:
//!
//! ```
//! use rust_evb::observers::ObserverRegistry;
//!
//! let mut registry = ObserverRegistry::default();
//! let id = registry.add_duplicate_observer(Box::new(|sid: u32, ts: u64| {
//!     eprintln!("source {sid} repeated timestamp {ts}");
//! }));
//! assert!(registry.remove_duplicate_observer(id));
//! assert!(!registry.remove_duplicate_observer(id));
//! ```

use crate::fragment::Fragment;
use std::sync::atomic::{AtomicU64, Ordering};

/// Receives every ordered batch the handler emits.
pub trait EventObserver: Send {
    /// Called once per non-empty output batch, in timestamp order.
    fn on_events(&mut self, batch: &[Fragment]);
}

/// Receives fragments that arrive after later data was already emitted.
pub trait DataLateObserver: Send {
    /// `newest_output` is the timestamp of the most recently emitted fragment.
    fn on_data_late(&mut self, fragment: &Fragment, newest_output: u64);
}

/// Receives consecutive same-timestamp fragments from one source.
pub trait DuplicateTimestampObserver: Send {
    /// Called when `source_id` produced `timestamp` more than once in a row.
    fn on_duplicate_timestamp(&mut self, source_id: u32, timestamp: u64);
}

/// Receives timestamps that go backwards within a single source.
pub trait NonMonotonicTimestampObserver: Send {
    /// `prior` is the source's newest timestamp before `current` arrived.
    fn on_non_monotonic(&mut self, source_id: u32, prior: u64, current: u64);
}

/// Receives barriers every live source contributed to.
pub trait BarrierObserver: Send {
    /// `(source_id, barrier_type)` per contributing source.
    fn on_complete_barrier(&mut self, types_present: &[(u32, u32)]);
}

/// Receives barriers resolved without every live source.
pub trait PartialBarrierObserver: Send {
    /// Contributing `(source_id, barrier_type)` pairs and the sources that had none.
    fn on_partial_barrier(&mut self, types_present: &[(u32, u32)], missing_sources: &[u32]);
}

/// Receives backpressure transitions.
pub trait FlowControlObserver: Send {
    /// Queued data fell to the Xon threshold; producers may resume.
    fn xon(&mut self);
    /// Queued data exceeded the Xoff threshold; producers should pause.
    fn xoff(&mut self);
}

impl<F: FnMut(&[Fragment]) + Send> EventObserver for F {
    fn on_events(&mut self, batch: &[Fragment]) {
        self(batch)
    }
}

impl<F: FnMut(&Fragment, u64) + Send> DataLateObserver for F {
    fn on_data_late(&mut self, fragment: &Fragment, newest_output: u64) {
        self(fragment, newest_output)
    }
}

impl<F: FnMut(u32, u64) + Send> DuplicateTimestampObserver for F {
    fn on_duplicate_timestamp(&mut self, source_id: u32, timestamp: u64) {
        self(source_id, timestamp)
    }
}

impl<F: FnMut(u32, u64, u64) + Send> NonMonotonicTimestampObserver for F {
    fn on_non_monotonic(&mut self, source_id: u32, prior: u64, current: u64) {
        self(source_id, prior, current)
    }
}

impl<F: FnMut(&[(u32, u32)]) + Send> BarrierObserver for F {
    fn on_complete_barrier(&mut self, types_present: &[(u32, u32)]) {
        self(types_present)
    }
}

impl<F: FnMut(&[(u32, u32)], &[u32]) + Send> PartialBarrierObserver for F {
    fn on_partial_barrier(&mut self, types_present: &[(u32, u32)], missing_sources: &[u32]) {
        self(types_present, missing_sources)
    }
}

/// Handle identifying one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

static NEXT_OBSERVER_ID: AtomicU64 = AtomicU64::new(1);

impl ObserverId {
    fn next() -> Self {
        Self(NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Ordered list of observers of one kind.
pub struct ObserverList<T: ?Sized> {
    entries: Vec<(ObserverId, Box<T>)>,
}

impl<T: ?Sized> Default for ObserverList<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T: ?Sized> std::fmt::Debug for ObserverList<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverList")
            .field("len", &self.entries.len())
            .finish()
    }
}

impl<T: ?Sized> ObserverList<T> {
    /// Append an observer; it runs after all earlier registrations.
    pub fn add(&mut self, observer: Box<T>) -> ObserverId {
        let id = ObserverId::next();
        self.entries.push((id, observer));
        id
    }

    /// Remove a registration. Unknown ids are ignored.
    pub fn remove(&mut self, id: ObserverId) -> bool {
        match self.entries.iter().position(|(entry_id, _)| *entry_id == id) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Number of registered observers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no observers are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run `f` on every observer in registration order.
    pub fn notify(&mut self, mut f: impl FnMut(&mut T)) {
        for (_, observer) in self.entries.iter_mut() {
            f(observer.as_mut());
        }
    }
}

/// All observer lists owned by a fragment handler.
#[derive(Debug, Default)]
pub struct ObserverRegistry {
    pub(crate) events: ObserverList<dyn EventObserver>,
    pub(crate) data_late: ObserverList<dyn DataLateObserver>,
    pub(crate) duplicates: ObserverList<dyn DuplicateTimestampObserver>,
    pub(crate) non_monotonic: ObserverList<dyn NonMonotonicTimestampObserver>,
    pub(crate) complete_barriers: ObserverList<dyn BarrierObserver>,
    pub(crate) partial_barriers: ObserverList<dyn PartialBarrierObserver>,
    pub(crate) flow_control: ObserverList<dyn FlowControlObserver>,
}

impl ObserverRegistry {
    /// Register an output observer.
    pub fn add_event_observer(&mut self, observer: Box<dyn EventObserver>) -> ObserverId {
        self.events.add(observer)
    }

    /// Unregister an output observer.
    pub fn remove_event_observer(&mut self, id: ObserverId) -> bool {
        self.events.remove(id)
    }

    /// Register a data-late observer.
    pub fn add_data_late_observer(&mut self, observer: Box<dyn DataLateObserver>) -> ObserverId {
        self.data_late.add(observer)
    }

    /// Unregister a data-late observer.
    pub fn remove_data_late_observer(&mut self, id: ObserverId) -> bool {
        self.data_late.remove(id)
    }

    /// Register a duplicate-timestamp observer.
    pub fn add_duplicate_observer(
        &mut self,
        observer: Box<dyn DuplicateTimestampObserver>,
    ) -> ObserverId {
        self.duplicates.add(observer)
    }

    /// Unregister a duplicate-timestamp observer.
    pub fn remove_duplicate_observer(&mut self, id: ObserverId) -> bool {
        self.duplicates.remove(id)
    }

    /// Register a non-monotonic timestamp observer.
    pub fn add_non_monotonic_observer(
        &mut self,
        observer: Box<dyn NonMonotonicTimestampObserver>,
    ) -> ObserverId {
        self.non_monotonic.add(observer)
    }

    /// Unregister a non-monotonic timestamp observer.
    pub fn remove_non_monotonic_observer(&mut self, id: ObserverId) -> bool {
        self.non_monotonic.remove(id)
    }

    /// Register a complete-barrier observer.
    pub fn add_barrier_observer(&mut self, observer: Box<dyn BarrierObserver>) -> ObserverId {
        self.complete_barriers.add(observer)
    }

    /// Unregister a complete-barrier observer.
    pub fn remove_barrier_observer(&mut self, id: ObserverId) -> bool {
        self.complete_barriers.remove(id)
    }

    /// Register a partial-barrier observer.
    pub fn add_partial_barrier_observer(
        &mut self,
        observer: Box<dyn PartialBarrierObserver>,
    ) -> ObserverId {
        self.partial_barriers.add(observer)
    }

    /// Unregister a partial-barrier observer.
    pub fn remove_partial_barrier_observer(&mut self, id: ObserverId) -> bool {
        self.partial_barriers.remove(id)
    }

    /// Register a flow-control observer.
    pub fn add_flow_control_observer(
        &mut self,
        observer: Box<dyn FlowControlObserver>,
    ) -> ObserverId {
        self.flow_control.add(observer)
    }

    /// Unregister a flow-control observer.
    pub fn remove_flow_control_observer(&mut self, id: ObserverId) -> bool {
        self.flow_control.remove(id)
    }

    pub(crate) fn notify_events(&mut self, batch: &[Fragment]) {
        if batch.is_empty() {
            return;
        }
        self.events.notify(|o| o.on_events(batch));
    }

    pub(crate) fn notify_data_late(&mut self, fragment: &Fragment, newest_output: u64) {
        self.data_late
            .notify(|o| o.on_data_late(fragment, newest_output));
    }

    pub(crate) fn notify_duplicate(&mut self, source_id: u32, timestamp: u64) {
        self.duplicates
            .notify(|o| o.on_duplicate_timestamp(source_id, timestamp));
    }

    pub(crate) fn notify_non_monotonic(&mut self, source_id: u32, prior: u64, current: u64) {
        self.non_monotonic
            .notify(|o| o.on_non_monotonic(source_id, prior, current));
    }

    pub(crate) fn notify_complete_barrier(&mut self, types_present: &[(u32, u32)]) {
        self.complete_barriers
            .notify(|o| o.on_complete_barrier(types_present));
    }

    pub(crate) fn notify_partial_barrier(&mut self, types_present: &[(u32, u32)], missing: &[u32]) {
        self.partial_barriers
            .notify(|o| o.on_partial_barrier(types_present, missing));
    }

    pub(crate) fn notify_xon(&mut self) {
        self.flow_control.notify(|o| o.xon());
    }

    pub(crate) fn notify_xoff(&mut self) {
        self.flow_control.notify(|o| o.xoff());
    }
}
