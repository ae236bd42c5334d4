//! Error types for the station management core.

use wlancm_commands::{PoolError, QueueError};

use crate::types::VdevId;

/// Synchronous admission result of a request.
///
/// `Ok` corresponds to the request having been queued. Everything that
/// happens after admission is reported through the request's callback.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// Vdev is not registered or cannot carry this request
    #[error("Invalid vdev: {0}")]
    InvalidVdev(VdevId),

    /// No free command slot, or no room for another session
    #[error("No memory: {0}")]
    NoMemory(String),

    /// A conflicting command is in flight for the same target
    #[error("Busy: {0}")]
    Busy(String),

    /// A command on the same target is in flight; retry once it completes
    #[error("Pending: {0}")]
    Pending(String),

    /// Target is not in a state that accepts this request
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Malformed request parameters
    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    /// Context has been closed
    #[error("Context closed")]
    Closed,

    /// Internal bookkeeping failure
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<QueueError> for RequestError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Pool(PoolError::Exhausted { capacity }) => {
                RequestError::NoMemory(format!("all {} command slots in use", capacity))
            }
            other => RequestError::Internal(other.to_string()),
        }
    }
}

/// Result type for requests.
pub type Result<T> = std::result::Result<T, RequestError>;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
