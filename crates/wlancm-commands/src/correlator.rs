//! Response correlation.
//!
//! Firmware responses carry no request id, so a response is matched to
//! whichever command currently holds the active slot. The only check is
//! that the response kind equals the active command's kind. Reordering by
//! the transport cannot be detected here.

use serde::{Deserialize, Serialize};

use crate::command::{Command, CommandKind, CommandOutcome};
use crate::pool::CommandHandle;
use crate::queue::SerializationQueue;

/// Result of correlating one response.
#[derive(Debug)]
pub enum Correlation<K, P> {
    /// Response belongs to the active command, which has left the queue.
    Matched {
        handle: CommandHandle,
        command: Command<K, P>,
    },
    /// No command was active.
    Orphan { received: K },
    /// Active command has another kind.
    ///
    /// `released` holds the active command when its kind consumes the slot
    /// on mismatch; otherwise the queue is untouched.
    Mismatch {
        expected: K,
        received: K,
        released: Option<(CommandHandle, Command<K, P>)>,
    },
}

impl<K, P> Correlation<K, P> {
    /// Check if the response was matched.
    pub fn is_matched(&self) -> bool {
        matches!(self, Correlation::Matched { .. })
    }
}

/// Correlator statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CorrelatorStats {
    /// Responses matched to the active command
    pub matched: u64,
    /// Responses that arrived with nothing active
    pub orphaned: u64,
    /// Responses whose kind differed from the active command
    pub mismatched: u64,
}

/// Matches inbound responses to the active command.
#[derive(Debug, Default)]
pub struct ResponseCorrelator {
    stats: CorrelatorStats,
}

impl ResponseCorrelator {
    /// Create a new correlator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Correlate a response of kind `received` against the queue head.
    pub fn correlate<K: CommandKind, P>(
        &mut self,
        queue: &mut SerializationQueue<K, P>,
        received: K,
    ) -> Correlation<K, P> {
        let Some((handle, expected)) = queue.active().map(|(h, c)| (h, c.kind)) else {
            self.stats.orphaned += 1;
            tracing::warn!("Dropping {} response: no command is active", received);
            return Correlation::Orphan { received };
        };

        if expected != received {
            self.stats.mismatched += 1;
            let released = if expected.releases_on_mismatch() {
                tracing::warn!(
                    "Command mismatch: active {} {} got {} response, releasing slot",
                    expected,
                    handle,
                    received
                );
                queue
                    .retire(handle, CommandOutcome::Dropped)
                    .ok()
                    .map(|command| (handle, command))
            } else {
                tracing::warn!(
                    "Command mismatch: active {} {} got {} response, dropping response",
                    expected,
                    handle,
                    received
                );
                None
            };
            return Correlation::Mismatch {
                expected,
                received,
                released,
            };
        }

        match queue.complete(handle) {
            Ok(command) => {
                self.stats.matched += 1;
                tracing::debug!(
                    "Matched {} response to command {} (seq {})",
                    received,
                    handle,
                    command.sequence()
                );
                Correlation::Matched { handle, command }
            }
            Err(e) => {
                tracing::error!("Active command {} could not be completed: {}", handle, e);
                self.stats.orphaned += 1;
                Correlation::Orphan { received }
            }
        }
    }

    /// Get correlator statistics.
    pub fn stats(&self) -> CorrelatorStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::test_kind::TestKind;
    use std::time::{Duration, Instant};

    fn active_queue(kind: TestKind) -> SerializationQueue<TestKind, &'static str> {
        let mut q = SerializationQueue::new(2);
        q.enqueue(Command::new(kind, 0, "payload")).unwrap();
        q.activate_next(Instant::now(), |_| Duration::from_secs(1))
            .unwrap();
        q
    }

    #[test]
    fn test_correlate_match() {
        let mut q = active_queue(TestKind::Config);
        let mut correlator = ResponseCorrelator::new();

        match correlator.correlate(&mut q, TestKind::Config) {
            Correlation::Matched { command, .. } => assert_eq!(command.payload, "payload"),
            other => panic!("unexpected correlation: {:?}", other),
        }
        assert!(q.is_idle());
        assert_eq!(q.free_count(), 2);
        assert_eq!(correlator.stats().matched, 1);
    }

    #[test]
    fn test_correlate_orphan_is_noop() {
        let mut q: SerializationQueue<TestKind, ()> = SerializationQueue::new(2);
        let mut correlator = ResponseCorrelator::new();

        let result = correlator.correlate(&mut q, TestKind::Config);
        assert!(matches!(result, Correlation::Orphan { .. }));
        assert_eq!(q.stats().completed, 0);
        assert_eq!(q.free_count(), 2);
        assert_eq!(correlator.stats().orphaned, 1);
    }

    #[test]
    fn test_correlate_mismatch_keeps_active() {
        let mut q = active_queue(TestKind::Config);
        let mut correlator = ResponseCorrelator::new();

        let result = correlator.correlate(&mut q, TestKind::Roam);
        assert!(matches!(
            result,
            Correlation::Mismatch {
                expected: TestKind::Config,
                received: TestKind::Roam,
                released: None
            }
        ));
        assert!(q.active_handle().is_some());
        assert_eq!(correlator.stats().mismatched, 1);
    }

    #[test]
    fn test_correlate_mismatch_releases_policy_slot() {
        let mut q = active_queue(TestKind::Policy);
        let mut correlator = ResponseCorrelator::new();

        match correlator.correlate(&mut q, TestKind::Config) {
            Correlation::Mismatch { released, .. } => assert!(released.is_some()),
            other => panic!("unexpected correlation: {:?}", other),
        }
        assert!(q.active_handle().is_none());
        assert_eq!(q.free_count(), 2);
        let stats = q.stats();
        assert_eq!(stats.completed, 0);
        assert_eq!(stats.dropped, 1);
        q.audit().unwrap();
    }

    #[test]
    fn test_duplicate_response_is_orphan() {
        let mut q = active_queue(TestKind::Config);
        let mut correlator = ResponseCorrelator::new();

        assert!(correlator.correlate(&mut q, TestKind::Config).is_matched());
        assert!(matches!(
            correlator.correlate(&mut q, TestKind::Config),
            Correlation::Orphan { .. }
        ));
    }
}
