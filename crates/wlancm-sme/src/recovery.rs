//! Escalation to driver-wide recovery.

use serde::{Deserialize, Serialize};

use crate::command::SmeCommandKind;
use crate::types::VdevId;

/// Why recovery is requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryReason {
    /// Command pool stayed exhausted for too many consecutive requests
    PoolExhausted { consecutive: u32 },
    /// A connection-affecting command got no response in time
    CommandTimeout { kind: SmeCommandKind, vdev_id: VdevId },
    /// Roam notification contradicts the host's roam state
    RoamStateDivergence { vdev_id: VdevId, detail: String },
}

/// Performs driver-wide recovery.
///
/// Invoked with no context state borrowed.
pub trait RecoveryHandler: Send + Sync {
    fn trigger(&self, reason: RecoveryReason);
}

/// Recovery handler that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingRecovery;

impl RecoveryHandler for LoggingRecovery {
    fn trigger(&self, reason: RecoveryReason) {
        tracing::error!("Self-recovery requested: {:?}", reason);
    }
}

/// Counts consecutive failed pool acquisitions.
#[derive(Debug, Clone)]
pub(crate) struct ExhaustionTracker {
    threshold: u32,
    consecutive: u32,
}

impl ExhaustionTracker {
    pub(crate) fn new(threshold: u32) -> Self {
        Self {
            threshold,
            consecutive: 0,
        }
    }

    /// Record a failed acquisition. Returns the run length when it reaches
    /// the threshold, then starts counting again.
    pub(crate) fn record_failure(&mut self) -> Option<u32> {
        if self.threshold == 0 {
            return None;
        }
        self.consecutive += 1;
        if self.consecutive >= self.threshold {
            let run = self.consecutive;
            self.consecutive = 0;
            return Some(run);
        }
        None
    }

    pub(crate) fn record_success(&mut self) {
        self.consecutive = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_reached() {
        let mut tracker = ExhaustionTracker::new(3);
        assert_eq!(tracker.record_failure(), None);
        assert_eq!(tracker.record_failure(), None);
        assert_eq!(tracker.record_failure(), Some(3));
        // Counting restarts after escalation
        assert_eq!(tracker.record_failure(), None);
    }

    #[test]
    fn test_success_resets_run() {
        let mut tracker = ExhaustionTracker::new(2);
        assert_eq!(tracker.record_failure(), None);
        tracker.record_success();
        assert_eq!(tracker.record_failure(), None);
        assert_eq!(tracker.record_failure(), Some(2));
    }

    #[test]
    fn test_zero_threshold_disables() {
        let mut tracker = ExhaustionTracker::new(0);
        for _ in 0..100 {
            assert_eq!(tracker.record_failure(), None);
        }
    }
}
