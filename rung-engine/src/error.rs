//! Engine error types.

use thiserror::Error;

/// Errors raised by engine configuration and decisions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Allocation schedule is unusable
    #[error("Invalid allocation schedule: {0}")]
    InvalidSchedule(String),

    /// Ladder configuration is out of range
    #[error("Invalid ladder configuration: {0}")]
    InvalidLadder(String),
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
