use thiserror::Error;

use chronicle_core::EventId;

use crate::event_store::EventStoreError;
use crate::lock::LockError;

#[derive(Debug, Error)]
pub enum ReplayError {
    /// Another process holds the lock; the call is not retried.
    #[error("replay already in progress (lock '{lock_key}' is held)")]
    AlreadyInProgress { lock_key: String },

    #[error(transparent)]
    EventStore(#[from] EventStoreError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("event handler failed: {message}")]
    Handler {
        event_id: Option<EventId>,
        message: String,
    },

    #[error("disaster recovery incomplete; failed aggregate types: {}", .failed.join(", "))]
    RecoveryIncomplete { failed: Vec<String> },

    #[error("consistency check failed: {0}")]
    Validation(String),
}

impl ReplayError {
    pub fn is_already_in_progress(&self) -> bool {
        matches!(self, Self::AlreadyInProgress { .. })
    }
}
