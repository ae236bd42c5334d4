//! Serialization queue comprehensive tests.
//!
//! Exercises the pool partition invariant, correlation and cancellation
//! over long operation sequences.

use std::fmt;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use wlancm_commands::{
    Command, CommandHandle, CommandKind, Correlation, QueueError, ResponseCorrelator,
    SerializationQueue,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Kind {
    HwMode,
    Twt,
}

impl CommandKind for Kind {
    fn affects_connection(&self) -> bool {
        matches!(self, Kind::HwMode)
    }

    fn releases_on_mismatch(&self) -> bool {
        matches!(self, Kind::HwMode)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

const TIMEOUT: Duration = Duration::from_millis(50);

/// Helper to create a test command.
fn make_command(kind: Kind, vdev_id: u8, tag: u32) -> Command<Kind, u32> {
    Command::new(kind, vdev_id, tag)
}

#[test]
fn test_partition_invariant_under_random_operations() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut queue: SerializationQueue<Kind, u32> = SerializationQueue::new(6);
    let mut correlator = ResponseCorrelator::new();
    let mut reserved: Vec<CommandHandle> = Vec::new();
    let start = Instant::now();
    let mut callbacks_fired = 0u64;

    for step in 0..2000u32 {
        let now = start + Duration::from_millis(step as u64);
        match rng.gen_range(0..7) {
            0 => {
                if let Ok(h) = queue.acquire() {
                    reserved.push(h);
                }
            }
            1 => {
                if let Some(h) = reserved.pop() {
                    let kind = if rng.gen_bool(0.5) { Kind::HwMode } else { Kind::Twt };
                    queue.fill(h, make_command(kind, rng.gen_range(0..3), step)).unwrap();
                    queue.submit(h).unwrap();
                }
            }
            2 => {
                if let Some(h) = reserved.pop() {
                    queue.abandon(h).unwrap();
                }
            }
            3 => {
                queue.activate_next(now, |_| TIMEOUT);
            }
            4 => {
                let kind = if rng.gen_bool(0.5) { Kind::HwMode } else { Kind::Twt };
                if let Correlation::Matched { .. } = correlator.correlate(&mut queue, kind) {
                    callbacks_fired += 1;
                }
            }
            5 => {
                let victim = queue.pending_handles().next();
                if let Some(h) = victim {
                    queue.cancel(h).unwrap();
                }
            }
            _ => {
                queue.expire(now);
            }
        }

        queue.audit().unwrap();
    }

    let stats = queue.stats();
    assert_eq!(correlator.stats().matched, callbacks_fired);
    // Mismatches on HwMode also consume the slot, so completions can exceed matches
    assert!(stats.completed >= callbacks_fired);
    assert_eq!(
        stats.free + stats.reserved + stats.pending + usize::from(stats.active),
        stats.capacity
    );
}

#[test]
fn test_matched_response_returns_slot_exactly_once() {
    let mut queue: SerializationQueue<Kind, u32> = SerializationQueue::new(1);
    let mut correlator = ResponseCorrelator::new();

    queue.enqueue(make_command(Kind::Twt, 0, 1)).unwrap();
    queue.activate_next(Instant::now(), |_| TIMEOUT).unwrap();
    assert_eq!(queue.free_count(), 0);

    let matched = correlator.correlate(&mut queue, Kind::Twt);
    assert!(matched.is_matched());
    assert_eq!(queue.free_count(), 1);

    // A duplicate response finds nothing active and changes nothing
    let duplicate = correlator.correlate(&mut queue, Kind::Twt);
    assert!(matches!(duplicate, Correlation::Orphan { .. }));
    assert_eq!(queue.free_count(), 1);
    queue.audit().unwrap();
}

#[test]
fn test_exhausted_queue_leaves_pending_untouched() {
    let mut queue: SerializationQueue<Kind, u32> = SerializationQueue::new(2);
    queue.enqueue(make_command(Kind::HwMode, 0, 1)).unwrap();
    queue.enqueue(make_command(Kind::HwMode, 0, 2)).unwrap();

    let err = queue.enqueue(make_command(Kind::HwMode, 0, 3)).unwrap_err();
    assert!(matches!(err, QueueError::Pool(_)));
    assert_eq!(queue.pending_len(), 2);
    queue.audit().unwrap();
}

#[test]
fn test_sequential_commands_never_active_together() {
    let mut queue: SerializationQueue<Kind, u32> = SerializationQueue::new(4);
    let mut correlator = ResponseCorrelator::new();
    let now = Instant::now();

    let first = queue.enqueue(make_command(Kind::HwMode, 0, 1)).unwrap();
    let second = queue.enqueue(make_command(Kind::HwMode, 0, 2)).unwrap();

    assert_eq!(queue.activate_next(now, |_| TIMEOUT).unwrap().handle, first);
    assert!(queue.activate_next(now, |_| TIMEOUT).is_none());
    assert_eq!(queue.active_handle(), Some(first));

    correlator.correlate(&mut queue, Kind::HwMode);
    assert_eq!(queue.activate_next(now, |_| TIMEOUT).unwrap().handle, second);
}
