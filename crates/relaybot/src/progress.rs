//! Milestone-based progress throttling and the progress reporter handed to
//! transfer operations.

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const MILESTONES: [i32; 4] = [25, 50, 75, 100];

/// True iff a milestone `m` satisfies `last < m <= current`.
pub fn should_emit(current: i32, last: i32, milestones: &[i32]) -> bool {
    milestones.iter().any(|&m| last < m && m <= current)
}

/// `floor(done / total * 100)`, clamped to 100. An unknown (zero) total
/// reports 0 and relies on the forced final update.
pub fn percent_of(done: u64, total: u64) -> i32 {
    if total == 0 {
        return 0;
    }
    let pct = (done as u128 * 100) / total as u128;
    pct.min(100) as i32
}

/// Last emitted percentage for one transfer direction of one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MilestoneTracker {
    last_emitted: i32,
}

impl Default for MilestoneTracker {
    fn default() -> Self {
        Self { last_emitted: -1 }
    }
}

impl MilestoneTracker {
    /// Returns the percentage to display when `percent` crosses a new milestone.
    pub fn observe(&mut self, percent: i32) -> Option<i32> {
        if should_emit(percent, self.last_emitted, &MILESTONES) {
            self.last_emitted = percent;
            Some(percent)
        } else {
            None
        }
    }

    /// Whether 100% still has to be shown once the stage completes.
    pub fn needs_final(&self) -> bool {
        self.last_emitted < 100
    }

    pub fn mark_final(&mut self) {
        self.last_emitted = 100;
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("transfer cancelled by user")]
pub struct TransferCancelled;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub done: u64,
    pub total: u64,
}

/// Handed to a transfer; every report observes the item's cancellation signal.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    token: CancellationToken,
    tx: mpsc::UnboundedSender<Progress>,
}

impl ProgressReporter {
    pub fn new(token: CancellationToken) -> (Self, mpsc::UnboundedReceiver<Progress>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { token, tx }, rx)
    }

    pub fn report(&self, done: u64, total: u64) -> Result<(), TransferCancelled> {
        if self.token.is_cancelled() {
            return Err(TransferCancelled);
        }
        let _ = self.tx.send(Progress { done, total });
        Ok(())
    }
}
