//! Command data structures.
//!
//! Defines the envelope stored in each pool slot and the trait the owning
//! layer implements for its command kinds.

use std::fmt;
use std::hash::Hash;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Virtual device (interface) identifier as known to firmware.
pub type VdevId = u8;

/// Per-queue command sequence number.
///
/// Only used for logs and lifecycle events; it never travels to firmware.
pub type Sequence = u64;

/// Behaviour the serialization core needs from a command kind.
pub trait CommandKind: Copy + Eq + Hash + fmt::Debug + fmt::Display + Send + 'static {
    /// Whether a timeout of this kind escalates to self-recovery.
    fn affects_connection(&self) -> bool;

    /// Whether a response of another kind still consumes the active slot
    /// while a command of this kind is at the head.
    fn releases_on_mismatch(&self) -> bool {
        false
    }
}

/// Lifecycle of a pool slot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CommandState {
    /// Slot is on the free list
    Free,
    /// Slot acquired by a caller, not yet submitted
    Reserved,
    /// Submitted, waiting for the active slot
    Pending,
    /// Handed to the transport, waiting for the response
    Active,
}

impl CommandState {
    /// Get the state name.
    pub fn type_name(&self) -> &'static str {
        match self {
            CommandState::Free => "free",
            CommandState::Reserved => "reserved",
            CommandState::Pending => "pending",
            CommandState::Active => "active",
        }
    }
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_name())
    }
}

/// How a command left the queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CommandOutcome {
    /// Matched by a response, callback fired
    Completed,
    /// Withdrawn while pending
    Cancelled,
    /// Active deadline passed without a response
    TimedOut,
    /// Slot consumed by a response of the wrong kind
    Dropped,
    /// Transport refused the request
    PostFailed,
}

impl CommandOutcome {
    /// Get the outcome name.
    pub fn type_name(&self) -> &'static str {
        match self {
            CommandOutcome::Completed => "completed",
            CommandOutcome::Cancelled => "cancelled",
            CommandOutcome::TimedOut => "timed_out",
            CommandOutcome::Dropped => "dropped",
            CommandOutcome::PostFailed => "post_failed",
        }
    }
}

impl fmt::Display for CommandOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_name())
    }
}

/// A command occupying one pool slot.
pub struct Command<K, P> {
    /// Command kind, checked against the response kind
    pub kind: K,
    /// Owning virtual device
    pub vdev_id: VdevId,
    /// Kind-specific payload, including the owner's callback
    pub payload: P,
    sequence: Sequence,
    state: CommandState,
    created_at: DateTime<Utc>,
    activated_at: Option<Instant>,
    deadline: Option<Instant>,
}

impl<K: CommandKind, P> Command<K, P> {
    /// Create a new command.
    pub fn new(kind: K, vdev_id: VdevId, payload: P) -> Self {
        Self {
            kind,
            vdev_id,
            payload,
            sequence: 0,
            state: CommandState::Reserved,
            created_at: Utc::now(),
            activated_at: None,
            deadline: None,
        }
    }

    /// Sequence number assigned at submission.
    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CommandState {
        self.state
    }

    /// Creation timestamp.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Deadline for the response, set on activation.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time spent active so far.
    pub fn active_for(&self, now: Instant) -> Option<Duration> {
        self.activated_at
            .map(|at| now.saturating_duration_since(at))
    }

    /// Check if the active deadline has passed.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.state == CommandState::Active && self.deadline.is_some_and(|d| now >= d)
    }

    /// Consume the command, keeping the payload.
    pub fn into_payload(self) -> P {
        self.payload
    }

    pub(crate) fn mark_pending(&mut self, sequence: Sequence) {
        self.sequence = sequence;
        self.state = CommandState::Pending;
    }

    pub(crate) fn mark_active(&mut self, now: Instant, timeout: Duration) {
        self.state = CommandState::Active;
        self.activated_at = Some(now);
        self.deadline = Some(now + timeout);
    }

    pub(crate) fn mark_free(&mut self) {
        self.state = CommandState::Free;
    }
}

impl<K: fmt::Debug, P> fmt::Debug for Command<K, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("kind", &self.kind)
            .field("vdev_id", &self.vdev_id)
            .field("sequence", &self.sequence)
            .field("state", &self.state)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}
