//! Error types for event bus trigger connections

use crate::expr::ExpressionError;
use crate::store::StoreError;
use thiserror::Error;

/// Result type alias for event bus operations
pub type BusResult<T> = std::result::Result<T, BusError>;

/// Errors raised by sensor drivers and trigger connections
#[derive(Debug, Error)]
pub enum BusError {
    /// Subscription could not be established (bad spec, missing stream, ...)
    #[error("Setup error: {0}")]
    Setup(String),

    /// Trigger expression could not be parsed
    #[error("Expression error: {0}")]
    Expression(#[from] ExpressionError),

    /// Key/value store failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Transient broker failure (fetch, ack, commit)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Message payload could not be decoded
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Broker client is in an unrecoverable state; the process must restart
    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl BusError {
    /// Create a Setup error
    pub fn setup(msg: impl Into<String>) -> Self {
        Self::Setup(msg.into())
    }

    /// Create a Transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a Malformed error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    /// Create a Fatal error
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Whether retrying the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, BusError::Transport(_) | BusError::Store(_))
    }

    /// Whether the process has to restart to recover
    pub fn is_fatal(&self) -> bool {
        matches!(self, BusError::Fatal(_))
    }
}
