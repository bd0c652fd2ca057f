//! Xon/Xoff hysteresis on queued byte volume.

/// A change of flow-control state observers must hear about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlowTransition {
    Xon,
    Xoff,
}

/// Tracks queued bytes against the Xon/Xoff thresholds.
///
/// Xoff is asserted when queued bytes rise above `xoff_threshold` and released
/// once they fall to `xon_threshold` or below. Nothing forces
/// `xon_threshold < xoff_threshold`; a misordered pair just toggles more often.
#[derive(Debug, Clone)]
pub(crate) struct FlowController {
    pub(crate) xon_threshold: usize,
    pub(crate) xoff_threshold: usize,
    queued_bytes: usize,
    xoff_asserted: bool,
}

impl FlowController {
    pub(crate) fn new(xon_threshold: usize, xoff_threshold: usize) -> Self {
        Self {
            xon_threshold,
            xoff_threshold,
            queued_bytes: 0,
            xoff_asserted: false,
        }
    }

    pub(crate) fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    pub(crate) fn xoff_asserted(&self) -> bool {
        self.xoff_asserted
    }

    /// Account for newly queued data.
    pub(crate) fn enqueued(&mut self, bytes: usize) -> Option<FlowTransition> {
        self.queued_bytes += bytes;
        if !self.xoff_asserted && self.queued_bytes > self.xoff_threshold {
            self.xoff_asserted = true;
            return Some(FlowTransition::Xoff);
        }
        None
    }

    /// Account for data released to observers. Xon is evaluated separately,
    /// once the whole batch has been delivered.
    pub(crate) fn dequeued(&mut self, bytes: usize) {
        self.queued_bytes = self.queued_bytes.saturating_sub(bytes);
    }

    pub(crate) fn check_xon(&mut self) -> Option<FlowTransition> {
        if self.xoff_asserted && self.queued_bytes <= self.xon_threshold {
            self.xoff_asserted = false;
            return Some(FlowTransition::Xon);
        }
        None
    }

    /// Forget all queued data, releasing Xoff if it was asserted.
    pub(crate) fn reset(&mut self) -> Option<FlowTransition> {
        self.queued_bytes = 0;
        if self.xoff_asserted {
            self.xoff_asserted = false;
            return Some(FlowTransition::Xon);
        }
        None
    }
}
