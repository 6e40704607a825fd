//! # Error Types
//!
//! Central error taxonomy for the bus runtime. Every failure that crosses a
//! component boundary is expressed as a [`BusError`] so that the retrier,
//! the worker loop and the dead-letter path can classify it uniformly.

use thiserror::Error;
use uuid::Uuid;

/// Result type with the bus error.
pub type Result<T, E = BusError> = std::result::Result<T, E>;

/// Central error type for the messaging runtime.
#[derive(Debug, Error)]
pub enum BusError {
    /// A broker or network operation failed. `transient` marks errors the
    /// transport considers safe to retry without semantic risk.
    #[error("transport failure: {message}")]
    Transport { message: String, transient: bool },

    /// Message body could not be serialized or deserialized. Never retried;
    /// the message goes to the dead-letter destination.
    #[error("serialization failure: {0}")]
    Serialization(String),

    /// The wire carried a content type no registered serializer understands.
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),

    /// Two messages raced on the same saga instance. The losing transaction
    /// is aborted and the message redelivered with fresh state.
    #[error("concurrency conflict for saga {saga_id} at revision {revision}")]
    ConcurrencyConflict { saga_id: Uuid, revision: u64 },

    /// A user handler returned an error. Redelivery is governed by the
    /// transport's max-deliveries policy.
    #[error("handler failure: {0}")]
    Handler(String),

    /// Invalid bus configuration. Surfaces synchronously at start.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A saga, subscription or timeout store operation failed.
    #[error("store failure: {0}")]
    Store(String),

    /// The bus is shutting down and can no longer accept work.
    #[error("bus is shutting down")]
    ShuttingDown,
}

impl BusError {
    /// Create a transport error with an explicit transient classification.
    pub fn transport(message: impl Into<String>, transient: bool) -> Self {
        Self::Transport {
            message: message.into(),
            transient,
        }
    }

    /// Create a non-retriable serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    /// Create a handler error.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create a store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    /// Whether the retrier may re-attempt the failed operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport { transient: true, .. })
    }

    /// Whether the message that produced this error is poison: retrying can
    /// never succeed, so it is forwarded straight to the dead-letter queue.
    pub fn is_poison(&self) -> bool {
        matches!(
            self,
            Self::Serialization(_) | Self::UnsupportedContentType(_)
        )
    }
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
