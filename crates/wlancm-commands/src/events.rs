//! Command lifecycle events.
//!
//! Provides event publishing and subscription for command lifecycle steps.
//! Publishing is synchronous so it can happen while the caller holds its
//! own state lock.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::command::{Sequence, VdevId};

/// Command lifecycle event types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CommandEventType {
    /// Command entered the pending list
    Queued,
    /// Command handed to the transport
    Activated,
    /// Response matched and callback fired
    Completed,
    /// Pending command withdrawn
    Cancelled,
    /// Active command ran past its deadline
    TimedOut,
    /// Response dropped (orphan or kind mismatch)
    Dropped,
    /// Transport refused the command
    PostFailed,
    /// Admission refused the request
    Rejected,
}

/// Command event with context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEvent {
    /// Event ID
    pub id: String,
    /// Event type
    pub event_type: CommandEventType,
    /// Command kind name
    pub kind: String,
    /// Command sequence, when the command reached the queue
    pub sequence: Option<Sequence>,
    /// Owning virtual device
    pub vdev_id: Option<VdevId>,
    /// Timestamp
    pub timestamp: DateTime<Utc>,
    /// Additional event data
    pub data: Option<serde_json::Value>,
}

impl CommandEvent {
    /// Create a new command event.
    pub fn new(event_type: CommandEventType, kind: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type,
            kind: kind.into(),
            sequence: None,
            vdev_id: None,
            timestamp: Utc::now(),
            data: None,
        }
    }

    /// Set sequence.
    pub fn with_sequence(mut self, sequence: Sequence) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Set virtual device.
    pub fn with_vdev(mut self, vdev_id: VdevId) -> Self {
        self.vdev_id = Some(vdev_id);
        self
    }

    /// Set additional data.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Event filter for subscriptions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    /// Filter by virtual device
    pub vdev_id: Option<VdevId>,
    /// Filter by command kind name
    pub kind: Option<String>,
    /// Filter by event types
    pub event_types: Option<Vec<CommandEventType>>,
}

impl EventFilter {
    /// Create a new empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Only events of these types.
    pub fn with_types(mut self, types: impl IntoIterator<Item = CommandEventType>) -> Self {
        self.event_types = Some(types.into_iter().collect());
        self
    }

    /// Only events for this virtual device.
    pub fn with_vdev(mut self, vdev_id: VdevId) -> Self {
        self.vdev_id = Some(vdev_id);
        self
    }

    /// Check if an event matches this filter.
    pub fn matches(&self, event: &CommandEvent) -> bool {
        if let Some(vdev_id) = self.vdev_id
            && event.vdev_id != Some(vdev_id)
        {
            return false;
        }

        if let Some(ref kind) = self.kind
            && &event.kind != kind
        {
            return false;
        }

        if let Some(ref event_types) = self.event_types
            && !event_types.contains(&event.event_type)
        {
            return false;
        }

        true
    }
}

/// Event bus for command events.
pub struct CommandEventBus {
    /// Broadcast sender for all events
    broadcast_tx: broadcast::Sender<CommandEvent>,
    /// Recent events, oldest first
    recent_events: Mutex<VecDeque<CommandEvent>>,
    /// Maximum events to store
    max_stored: usize,
}

impl CommandEventBus {
    /// Create a new event bus.
    pub fn new(max_stored: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(1000);

        Self {
            broadcast_tx,
            recent_events: Mutex::new(VecDeque::with_capacity(max_stored)),
            max_stored,
        }
    }

    /// Publish an event.
    pub fn publish(&self, event: CommandEvent) {
        if self.max_stored > 0 {
            let mut events = self.recent_events.lock();
            if events.len() == self.max_stored {
                events.pop_front();
            }
            events.push_back(event.clone());
        }

        // No subscribers is not an error
        let _ = self.broadcast_tx.send(event);
    }

    /// Subscribe to all events.
    pub fn subscribe(&self) -> broadcast::Receiver<CommandEvent> {
        self.broadcast_tx.subscribe()
    }

    /// Subscribe with a filter.
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredSubscriber {
        FilteredSubscriber {
            rx: self.broadcast_tx.subscribe(),
            filter,
        }
    }

    /// Get recent events, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<CommandEvent> {
        let events = self.recent_events.lock();
        let start = events.len().saturating_sub(limit);
        events.iter().skip(start).cloned().collect()
    }

    /// Get recent events for a virtual device, newest first.
    pub fn recent_for_vdev(&self, vdev_id: VdevId, limit: usize) -> Vec<CommandEvent> {
        self.recent_events
            .lock()
            .iter()
            .rev()
            .filter(|e| e.vdev_id == Some(vdev_id))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Get events for one command sequence.
    pub fn for_sequence(&self, sequence: Sequence) -> Vec<CommandEvent> {
        self.recent_events
            .lock()
            .iter()
            .filter(|e| e.sequence == Some(sequence))
            .cloned()
            .collect()
    }

    /// Clear all stored events.
    pub fn clear(&self) {
        self.recent_events.lock().clear();
    }
}

impl Default for CommandEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Filtered event subscriber.
pub struct FilteredSubscriber {
    rx: broadcast::Receiver<CommandEvent>,
    filter: EventFilter,
}

impl FilteredSubscriber {
    /// Receive next filtered event.
    pub async fn recv(&mut self) -> Result<CommandEvent, broadcast::error::RecvError> {
        loop {
            let event = self.rx.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// Try to receive next filtered event without blocking.
    pub fn try_recv(&mut self) -> Result<CommandEvent, broadcast::error::TryRecvError> {
        loop {
            let event = self.rx.try_recv()?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}
