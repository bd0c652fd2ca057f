//! Decoupled output delivery.
//!
//! Event observers registered directly on a [`FragmentHandler`] run inside the
//! flush, so a slow consumer (disk, network) stalls ordering. An
//! [`OutputStage`] moves that work onto its own task: the handler side pushes
//! each ordered batch into a bounded channel and the stage replays the batches,
//! in order, to its own observer list.
//!
//! ```text
//! FragmentHandler ── BatchForwarder ──> PendingBatches ──> mpsc (bounded) ──> OutputStage
//!     (flush)          (observer)          (service)                          (observers)
//! ```
//!
//! The channel is bounded, so a stalled stage pushes back on the service task
//! instead of dropping data.
//!
//! [`FragmentHandler`]: crate::handler::FragmentHandler

use crate::fragment::Fragment;
use crate::observers::{EventObserver, ObserverId, ObserverList};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, Instrument};

/// Totals reported by an output stage when it stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputReport {
    /// Batches delivered to the stage observers.
    pub batches: u64,
    /// Fragments delivered to the stage observers.
    pub fragments: u64,
}

/// Owns a list of event observers and feeds them from a channel.
#[derive(Debug, Default)]
pub struct OutputStage {
    observers: ObserverList<dyn EventObserver>,
}

impl OutputStage {
    /// A stage with no observers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer for ordered batches.
    pub fn add_observer(&mut self, observer: Box<dyn EventObserver>) -> ObserverId {
        self.observers.add(observer)
    }

    /// Remove an observer; unknown ids are ignored.
    pub fn remove_observer(&mut self, id: ObserverId) -> bool {
        self.observers.remove(id)
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Start the stage on the current runtime.
    ///
    /// The stage runs until every sender is dropped and the channel is
    /// drained, then resolves to an [`OutputReport`].
    pub fn spawn(self, capacity: usize) -> (mpsc::Sender<Vec<Fragment>>, JoinHandle<OutputReport>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(self.run(rx).instrument(tracing::info_span!("evb_output")));
        (tx, task)
    }

    async fn run(mut self, mut batches: mpsc::Receiver<Vec<Fragment>>) -> OutputReport {
        let mut report = OutputReport::default();
        debug!(observers = self.observers.len(), "Output stage started");

        while let Some(batch) = batches.recv().await {
            report.batches += 1;
            report.fragments += batch.len() as u64;
            self.observers.notify(|observer| observer.on_events(&batch));
        }

        info!(
            batches = report.batches,
            fragments = report.fragments,
            "Output stage stopped"
        );
        report
    }
}

/// Batches captured by a [`BatchForwarder`] and not yet sent to the stage.
pub(crate) type PendingBatches = Arc<Mutex<VecDeque<Vec<Fragment>>>>;

/// Event observer that parks each ordered batch for the service to forward.
///
/// Runs inside the handler flush, which is synchronous, so it only queues;
/// the awaiting send happens in the service loop.
pub(crate) struct BatchForwarder {
    pending: PendingBatches,
}

impl BatchForwarder {
    pub(crate) fn new(pending: PendingBatches) -> Self {
        Self { pending }
    }
}

impl EventObserver for BatchForwarder {
    fn on_events(&mut self, batch: &[Fragment]) {
        self.pending.lock().push_back(batch.to_vec());
    }
}
