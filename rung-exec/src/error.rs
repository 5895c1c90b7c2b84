//! Execution layer error types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of an exchange rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionKind {
    /// Same order is already resting on the exchange
    Duplicate,
    /// Exchange-side order or quantity limit reached
    LimitExceeded,
    /// Anything else
    Other,
}

impl RejectionKind {
    /// Classify an exchange rejection message.
    pub fn classify(message: &str) -> Self {
        let msg = message.to_ascii_lowercase();
        if msg.contains("duplicate") || msg.contains("already exist") || msg.contains("repeat") {
            RejectionKind::Duplicate
        } else if msg.contains("exceed") || msg.contains("limit reached") || msg.contains("too many") {
            RejectionKind::LimitExceeded
        } else {
            RejectionKind::Other
        }
    }
}

/// Errors that can occur during execution operations.
#[derive(Debug, Error)]
pub enum ExecError {
    /// Exchange communication error (network, timeout, 5xx); retry later
    #[error("Exchange error: {0}")]
    Exchange(String),

    /// Order was rejected by exchange
    #[error("Order rejected ({kind:?}): {message}")]
    Rejected {
        /// Rejection class
        kind: RejectionKind,
        /// Exchange message
        message: String,
    },

    /// Exchange answered with something we could not interpret
    #[error("Invalid exchange response: {0}")]
    InvalidResponse(String),

    /// Domain error
    #[error("Domain error: {0}")]
    Domain(#[from] rung_domain::DomainError),

    /// Market data subscription error
    #[error("Market data error: {0}")]
    MarketData(String),

    /// Notification or history sink error
    #[error("Sink error: {0}")]
    Sink(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timeout waiting for operation
    #[error("Timeout: {0}")]
    Timeout(String),
}

impl ExecError {
    /// Build a rejection, classifying the exchange message.
    pub fn rejected(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::Rejected {
            kind: RejectionKind::classify(&message),
            message,
        }
    }

    /// Rejection class, if this is a rejection.
    pub fn rejection(&self) -> Option<RejectionKind> {
        match self {
            Self::Rejected { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Duplicate or limit-exceeded rejections: the order (or an equivalent
    /// one) is already on the book, so the caller may treat it as placed.
    pub fn is_expected_rejection(&self) -> bool {
        matches!(
            self.rejection(),
            Some(RejectionKind::Duplicate | RejectionKind::LimitExceeded)
        )
    }

    /// Worth retrying on the next cycle without changing anything.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Exchange(_) | Self::Timeout(_) | Self::MarketData(_))
    }
}

/// Result type for execution operations.
pub type ExecResult<T> = Result<T, ExecError>;
