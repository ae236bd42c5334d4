//! Serialization queue for firmware commands.
//!
//! Owns the command pool and turns submissions into at-most-one-active
//! execution. Pending commands are kept in FIFO order; the head is only
//! promoted once the active slot is empty.
//!
//! Slot lifecycle:
//!
//! ```text
//! Free -(acquire)-> Reserved -(submit)-> Pending -(head, nothing active)-> Active
//!   ^                  |                    |                                |
//!   +----(abandon)-----+----(cancel)--------+---(complete / expire)----------+
//! ```

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::command::{Command, CommandKind, CommandOutcome, CommandState, Sequence, VdevId};
use crate::error::{QueueError, Result};
use crate::pool::{CommandHandle, CommandPool};

/// Queue statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueStats {
    /// Total number of slots
    pub capacity: usize,
    /// Slots on the free list
    pub free: usize,
    /// Slots acquired but not yet submitted
    pub reserved: usize,
    /// Commands waiting for the active slot
    pub pending: usize,
    /// Whether a command is active
    pub active: bool,
    /// Commands submitted since creation
    pub submitted: u64,
    /// Commands completed by a response
    pub completed: u64,
    /// Active commands released by a response of another kind
    pub dropped: u64,
    /// Active commands the transport refused
    pub post_failed: u64,
    /// Pending commands withdrawn
    pub cancelled: u64,
    /// Active commands that ran past their deadline
    pub timed_out: u64,
    /// Failed acquisitions
    pub exhausted: u64,
}

/// A command promoted to the active slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Activation<K> {
    /// Handle of the now-active command
    pub handle: CommandHandle,
    /// Command kind
    pub kind: K,
    /// Owning virtual device
    pub vdev_id: VdevId,
    /// Submission sequence
    pub sequence: Sequence,
    /// Response deadline
    pub deadline: Instant,
}

/// Single-outstanding command queue backed by a fixed pool.
pub struct SerializationQueue<K, P> {
    pool: CommandPool<Command<K, P>>,
    reserved: HashSet<CommandHandle>,
    pending: VecDeque<CommandHandle>,
    active: Option<CommandHandle>,
    next_sequence: Sequence,
    stats: QueueStats,
}

impl<K: CommandKind, P> SerializationQueue<K, P> {
    /// Create a queue over a pool of `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            pool: CommandPool::new(capacity),
            reserved: HashSet::new(),
            pending: VecDeque::new(),
            active: None,
            next_sequence: 1,
            stats: QueueStats {
                capacity,
                ..Default::default()
            },
        }
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    /// Number of free slots.
    pub fn free_count(&self) -> usize {
        self.pool.free_count()
    }

    /// Number of pending commands.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Check if nothing is pending or active.
    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.pending.is_empty()
    }

    /// Handles of pending commands, head first.
    pub fn pending_handles(&self) -> impl Iterator<Item = CommandHandle> + '_ {
        self.pending.iter().copied()
    }

    /// Reserve a slot for a new command.
    pub fn acquire(&mut self) -> Result<CommandHandle> {
        match self.pool.acquire() {
            Ok(handle) => {
                self.reserved.insert(handle);
                Ok(handle)
            }
            Err(e) => {
                self.stats.exhausted += 1;
                Err(e.into())
            }
        }
    }

    /// Fill a reserved slot.
    pub fn fill(&mut self, handle: CommandHandle, command: Command<K, P>) -> Result<()> {
        if !self.reserved.contains(&handle) {
            return Err(QueueError::NotReserved(handle));
        }
        self.pool.put(handle, command)?;
        Ok(())
    }

    /// Move a filled reserved command to the back of the pending list.
    ///
    /// Returns the command's position in the pending list.
    pub fn submit(&mut self, handle: CommandHandle) -> Result<usize> {
        if !self.reserved.contains(&handle) {
            return Err(QueueError::NotReserved(handle));
        }

        let sequence = self.next_sequence;
        self.pool.get_mut(handle)?.mark_pending(sequence);
        self.next_sequence += 1;

        self.reserved.remove(&handle);
        self.pending.push_back(handle);
        self.stats.submitted += 1;

        Ok(self.pending.len() - 1)
    }

    /// Acquire, fill and submit in one step.
    pub fn enqueue(&mut self, command: Command<K, P>) -> Result<CommandHandle> {
        let handle = self.acquire()?;
        if let Err(e) = self.fill(handle, command) {
            let _ = self.abandon(handle);
            return Err(e);
        }
        self.submit(handle)?;
        Ok(handle)
    }

    /// Give back a reserved slot without submitting it.
    pub fn abandon(&mut self, handle: CommandHandle) -> Result<Option<Command<K, P>>> {
        if !self.reserved.remove(&handle) {
            return Err(QueueError::NotReserved(handle));
        }
        Ok(self.release(handle)?)
    }

    /// Promote the pending head if nothing is active.
    ///
    /// `timeout_for` supplies the response bound for the promoted kind.
    pub fn activate_next(
        &mut self,
        now: Instant,
        timeout_for: impl FnOnce(K) -> Duration,
    ) -> Option<Activation<K>> {
        if self.active.is_some() {
            return None;
        }

        let handle = self.pending.pop_front()?;
        let command = match self.pool.get_mut(handle) {
            Ok(command) => command,
            Err(e) => {
                tracing::error!("Pending list held an invalid handle {}: {}", handle, e);
                return None;
            }
        };

        let timeout = timeout_for(command.kind);
        command.mark_active(now, timeout);
        self.active = Some(handle);

        Some(Activation {
            handle,
            kind: command.kind,
            vdev_id: command.vdev_id,
            sequence: command.sequence(),
            deadline: now + timeout,
        })
    }

    /// Handle of the active command.
    pub fn active_handle(&self) -> Option<CommandHandle> {
        self.active
    }

    /// Borrow the active command.
    pub fn active(&self) -> Option<(CommandHandle, &Command<K, P>)> {
        let handle = self.active?;
        self.pool.get(handle).ok().map(|command| (handle, command))
    }

    /// Borrow a queued or reserved command.
    pub fn get(&self, handle: CommandHandle) -> Result<&Command<K, P>> {
        Ok(self.pool.get(handle)?)
    }

    /// Mutably borrow a queued or reserved command.
    pub fn get_mut(&mut self, handle: CommandHandle) -> Result<&mut Command<K, P>> {
        Ok(self.pool.get_mut(handle)?)
    }

    /// Remove the active command after its response arrived.
    pub fn complete(&mut self, handle: CommandHandle) -> Result<Command<K, P>> {
        self.retire(handle, CommandOutcome::Completed)
    }

    /// Remove the active command and return its slot to the pool.
    ///
    /// `outcome` selects the counter the removal is recorded under.
    /// `Cancelled` and `TimedOut` belong to [`cancel`](Self::cancel) and
    /// [`expire`](Self::expire) and are rejected here.
    pub fn retire(
        &mut self,
        handle: CommandHandle,
        outcome: CommandOutcome,
    ) -> Result<Command<K, P>> {
        if self.active != Some(handle) {
            return Err(QueueError::NotActive(handle));
        }
        let counter = match outcome {
            CommandOutcome::Completed => &mut self.stats.completed,
            CommandOutcome::Dropped => &mut self.stats.dropped,
            CommandOutcome::PostFailed => &mut self.stats.post_failed,
            CommandOutcome::Cancelled | CommandOutcome::TimedOut => {
                return Err(QueueError::Inconsistent(format!(
                    "active slot {} cannot be retired as {}",
                    handle, outcome
                )));
            }
        };
        *counter += 1;
        self.active = None;
        self.release(handle)?.ok_or_else(|| {
            QueueError::Inconsistent(format!("active slot {} was empty", handle))
        })
    }

    /// Withdraw a pending command.
    ///
    /// Active commands have already reached firmware and can only time out.
    pub fn cancel(&mut self, handle: CommandHandle) -> Result<Command<K, P>> {
        if self.active == Some(handle) {
            return Err(QueueError::AlreadyActive(handle));
        }
        let position = self
            .pending
            .iter()
            .position(|&h| h == handle)
            .ok_or(QueueError::NotPending(handle))?;
        self.pending.remove(position);
        self.stats.cancelled += 1;
        self.release(handle)?.ok_or_else(|| {
            QueueError::Inconsistent(format!("pending slot {} was empty", handle))
        })
    }

    /// Withdraw every pending command matching `predicate`.
    pub fn cancel_where(
        &mut self,
        mut predicate: impl FnMut(&Command<K, P>) -> bool,
    ) -> Vec<(CommandHandle, Command<K, P>)> {
        let victims: Vec<CommandHandle> = self
            .pending
            .iter()
            .copied()
            .filter(|&h| self.pool.get(h).is_ok_and(&mut predicate))
            .collect();

        victims
            .into_iter()
            .filter_map(|h| self.cancel(h).ok().map(|command| (h, command)))
            .collect()
    }

    /// Withdraw every pending command owned by a virtual device.
    pub fn cancel_vdev(&mut self, vdev_id: VdevId) -> Vec<(CommandHandle, Command<K, P>)> {
        self.cancel_where(|command| command.vdev_id == vdev_id)
    }

    /// Remove the active command if its deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Option<(CommandHandle, Command<K, P>)> {
        let handle = self.active?;
        let expired = self
            .pool
            .get(handle)
            .is_ok_and(|command| command.is_expired(now));
        if !expired {
            return None;
        }

        self.active = None;
        self.stats.timed_out += 1;
        match self.release(handle) {
            Ok(Some(command)) => Some((handle, command)),
            Ok(None) => None,
            Err(e) => {
                tracing::error!("Failed to release expired command {}: {}", handle, e);
                None
            }
        }
    }

    /// Remove every pending and active command.
    pub fn drain(&mut self) -> Vec<(CommandHandle, Command<K, P>)> {
        let handles: Vec<CommandHandle> = self
            .active
            .take()
            .into_iter()
            .chain(self.pending.drain(..))
            .collect();

        handles
            .into_iter()
            .filter_map(|h| match self.release(h) {
                Ok(command) => command.map(|c| (h, c)),
                Err(e) => {
                    tracing::error!("Failed to release drained command {}: {}", h, e);
                    None
                }
            })
            .collect()
    }

    /// Get queue statistics.
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            capacity: self.pool.capacity(),
            free: self.pool.free_count(),
            reserved: self.reserved.len(),
            pending: self.pending.len(),
            active: self.active.is_some(),
            ..self.stats.clone()
        }
    }

    /// Verify that free, reserved, pending and active slots partition the pool.
    pub fn audit(&self) -> Result<()> {
        let mut seen: HashSet<usize> = HashSet::with_capacity(self.capacity());

        for index in self.pool.free_indices() {
            if !seen.insert(index) {
                return Err(QueueError::Inconsistent(format!(
                    "slot {} is on the free list twice",
                    index
                )));
            }
        }

        let queued = self
            .pending
            .iter()
            .map(|&h| (h, CommandState::Pending))
            .chain(self.active.map(|h| (h, CommandState::Active)));

        for (handle, expected) in queued {
            let command = self.pool.get(handle)?;
            if command.state() != expected {
                return Err(QueueError::Inconsistent(format!(
                    "slot {} is {} but listed as {}",
                    handle,
                    command.state(),
                    expected
                )));
            }
            if !seen.insert(handle.index()) {
                return Err(QueueError::Inconsistent(format!(
                    "slot {} is listed twice",
                    handle
                )));
            }
        }

        for handle in &self.reserved {
            if !self.pool.is_live(*handle) || !seen.insert(handle.index()) {
                return Err(QueueError::Inconsistent(format!(
                    "reserved slot {} is not exclusively owned",
                    handle
                )));
            }
        }

        if seen.len() != self.capacity() {
            return Err(QueueError::Inconsistent(format!(
                "{} of {} slots accounted for",
                seen.len(),
                self.capacity()
            )));
        }

        Ok(())
    }

    fn release(&mut self, handle: CommandHandle) -> Result<Option<Command<K, P>>> {
        let mut command = self.pool.release(handle)?;
        if let Some(command) = command.as_mut() {
            command.mark_free();
        }
        Ok(command)
    }
}
