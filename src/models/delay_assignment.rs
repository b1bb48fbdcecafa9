use serde::Serialize;
use uuid::Uuid;

/// A delay drawn for one row of a processing batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DelayAssignment {
    pub row_id: usize,
    /// Drawn delay, in delay units.
    pub delay: u64,
    pub completed: bool,
}

/// Outcome of a joined processing batch.
#[derive(Debug, Clone, Serialize)]
pub struct FanOutReport {
    pub batch_id: Uuid,
    /// Total rows handed in, including the ones skipped for having no name.
    pub row_count: usize,
    pub completed: Vec<DelayAssignment>,
    /// Rows whose timer was cancelled before it fired. Their delay was never written.
    pub pending: Vec<DelayAssignment>,
    /// Rows whose timer fired but whose write was never confirmed.
    pub unapplied: Vec<DelayAssignment>,
}

impl FanOutReport {
    pub fn is_complete(&self) -> bool {
        self.pending.is_empty() && self.unapplied.is_empty()
    }
}
