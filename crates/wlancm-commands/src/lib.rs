//! Command system for firmware-bound WLAN requests.
//!
//! Provides:
//! - Generation-checked pool of reusable command slots
//! - Serialization queue with a single active command
//! - Positional response correlation with a kind check
//! - Command lifecycle events

pub mod command;
pub mod correlator;
pub mod error;
pub mod events;
pub mod pool;
pub mod queue;

// Re-exports
pub use command::{Command, CommandKind, CommandOutcome, CommandState, Sequence, VdevId};

pub use pool::{CommandHandle, CommandPool};

pub use queue::{Activation, QueueStats, SerializationQueue};

pub use correlator::{Correlation, CorrelatorStats, ResponseCorrelator};

pub use error::{PoolError, QueueError};

pub use events::{CommandEvent, CommandEventBus, CommandEventType, EventFilter, FilteredSubscriber};
