//! Error types for the command system.

use crate::pool::CommandHandle;

/// Command pool error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("Command pool exhausted: all {capacity} slots in use")]
    Exhausted { capacity: usize },

    #[error("Stale command handle {0}")]
    StaleHandle(CommandHandle),

    #[error("Command slot {0} holds no command")]
    Vacant(CommandHandle),
}

/// Serialization queue error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Command {0} is not reserved")]
    NotReserved(CommandHandle),

    #[error("Command {0} is not pending")]
    NotPending(CommandHandle),

    #[error("Command {0} is already active and can only time out")]
    AlreadyActive(CommandHandle),

    #[error("Command {0} is not the active command")]
    NotActive(CommandHandle),

    #[error("Queue bookkeeping inconsistent: {0}")]
    Inconsistent(String),
}

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;
