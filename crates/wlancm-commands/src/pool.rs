//! Fixed-capacity pool of reusable command slots.
//!
//! Slots are addressed by generation-checked handles. Releasing a slot
//! advances its generation, so a handle kept past release is rejected
//! instead of aliasing the slot's next owner.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::PoolError;

/// Handle to an acquired pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandHandle {
    index: u32,
    generation: u32,
}

impl CommandHandle {
    /// Slot index.
    pub fn index(&self) -> usize {
        self.index as usize
    }

    /// Slot generation at acquisition time.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for CommandHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    in_use: bool,
    value: Option<T>,
}

/// Pool of reusable slots with a FIFO free list.
pub struct CommandPool<T> {
    slots: Vec<Slot<T>>,
    free: VecDeque<u32>,
}

impl<T> CommandPool<T> {
    /// Create a pool with `capacity` free slots.
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                in_use: false,
                value: None,
            })
            .collect();

        Self {
            slots,
            free: (0..capacity as u32).collect(),
        }
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots on the free list.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Number of slots currently owned by someone.
    pub fn in_use_count(&self) -> usize {
        self.capacity() - self.free_count()
    }

    /// Take a slot off the free list.
    pub fn acquire(&mut self) -> Result<CommandHandle, PoolError> {
        let index = self.free.pop_front().ok_or(PoolError::Exhausted {
            capacity: self.slots.len(),
        })?;

        let slot = &mut self.slots[index as usize];
        slot.in_use = true;

        Ok(CommandHandle {
            index,
            generation: slot.generation,
        })
    }

    /// Check if a handle still names a live slot.
    pub fn is_live(&self, handle: CommandHandle) -> bool {
        self.slots
            .get(handle.index())
            .is_some_and(|slot| slot.in_use && slot.generation == handle.generation)
    }

    /// Store a value in an acquired slot, replacing any previous one.
    pub fn put(&mut self, handle: CommandHandle, value: T) -> Result<(), PoolError> {
        let slot = self.live_slot_mut(handle)?;
        slot.value = Some(value);
        Ok(())
    }

    /// Borrow the value in a slot.
    pub fn get(&self, handle: CommandHandle) -> Result<&T, PoolError> {
        if !self.is_live(handle) {
            return Err(PoolError::StaleHandle(handle));
        }
        self.slots[handle.index()]
            .value
            .as_ref()
            .ok_or(PoolError::Vacant(handle))
    }

    /// Mutably borrow the value in a slot.
    pub fn get_mut(&mut self, handle: CommandHandle) -> Result<&mut T, PoolError> {
        self.live_slot_mut(handle)?
            .value
            .as_mut()
            .ok_or(PoolError::Vacant(handle))
    }

    /// Return a slot to the free list.
    ///
    /// The slot is emptied and its generation advanced. The previous value,
    /// if any, is handed back to the caller.
    pub fn release(&mut self, handle: CommandHandle) -> Result<Option<T>, PoolError> {
        let slot = self.live_slot_mut(handle)?;
        let value = slot.value.take();
        slot.in_use = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push_back(handle.index);
        Ok(value)
    }

    /// Indices currently on the free list.
    pub fn free_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.free.iter().map(|&i| i as usize)
    }

    fn live_slot_mut(&mut self, handle: CommandHandle) -> Result<&mut Slot<T>, PoolError> {
        match self.slots.get_mut(handle.index()) {
            Some(slot) if slot.in_use && slot.generation == handle.generation => Ok(slot),
            _ => Err(PoolError::StaleHandle(handle)),
        }
    }
}
