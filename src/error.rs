use thiserror::Error;

use crate::models::MessageState;
use crate::store::StoreError;
use crate::transport::TransportError;

/// Text rejected before it ever reaches the queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("message text is empty")]
    Empty,

    #[error("message text is {len} characters, the limit is {max}")]
    TooLong { len: usize, max: usize },
}

/// Errors surfaced by the sync engine
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Explicit denial from the server, e.g. a blocked counterpart
    #[error("server rejected message {temp_id}: {reason}")]
    ServerRejection { temp_id: String, reason: String },

    /// Receipt for an id that never materialized
    #[error("stale receipt for unknown message {0}")]
    StaleReceipt(String),

    #[error("unknown message {0}")]
    UnknownMessage(String),

    #[error("message {id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: String,
        from: MessageState,
        to: MessageState,
    },

    #[error("message {0} cannot be retried")]
    NotRetryable(String),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("sync engine has shut down")]
    Closed,
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
