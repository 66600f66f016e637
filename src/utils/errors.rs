// src/utils/errors.rs
//! Error types for the worker pool

use crate::runtime::worker::WorkerState;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PoolError>;

#[derive(Debug, Error)]
pub enum PoolError {
    /// Malformed configuration; the message names the offending field
    #[error("{0}")]
    InvalidConfig(String),

    /// Malformed request envelope
    #[error("{0}")]
    InvalidRequest(String),

    /// Expected backpressure: no slot and no queue room. Retry later.
    #[error("Pool saturated: {0}")]
    PoolSaturated(String),

    #[error("Worker spawn failed: {0}")]
    ProcessSpawnFailed(String),

    /// Socket error or unexpected exit while serving a request
    #[error("Worker fault: {0}")]
    WorkerFault(String),

    /// The worker completed the turn with an error reply
    #[error("Worker reported error: {0}")]
    WorkerError(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Pool is shutting down")]
    ShuttingDown,

    #[error("Invalid worker state transition: {from} -> {to}")]
    InvalidTransition { from: WorkerState, to: WorkerState },

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PoolError {
    /// True for saturation, which callers should treat as "retry later"
    /// rather than as a fault.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, PoolError::PoolSaturated(_))
    }
}

impl From<serde_json::Error> for PoolError {
    fn from(e: serde_json::Error) -> Self {
        PoolError::Ipc(format!("Malformed frame: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backpressure_classification() {
        assert!(PoolError::PoolSaturated("global queue full".into()).is_backpressure());
        assert!(!PoolError::WorkerFault("socket closed".into()).is_backpressure());
        assert!(!PoolError::Cancelled.is_backpressure());
    }

    #[test]
    fn test_transition_message() {
        let err = PoolError::InvalidTransition {
            from: WorkerState::Dead,
            to: WorkerState::Busy,
        };
        assert_eq!(err.to_string(), "Invalid worker state transition: dead -> busy");
    }
}
