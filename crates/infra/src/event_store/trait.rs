use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use chronicle_core::{DomainError, EventId, StreamKey};
use chronicle_events::DomainEvent;

use super::query::Pagination;

/// Event store operation error.
///
/// These are **infrastructure errors** (continuity, storage, transport) as
/// opposed to leaf-level codec problems, which never fail a read.
///
/// Publication failures after a successful persist are deliberately absent:
/// they are logged and counted, and the event stays readable.
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// The proposed version does not continue the stream.
    #[error("version conflict on {stream}: expected version {expected}, got {actual}")]
    VersionConflict {
        stream: String,
        expected: u64,
        actual: u64,
    },

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("persistence failed: {0}")]
    Persistence(String),

    #[error("subscription failed: {0}")]
    Subscription(String),

    #[error("event store is closed")]
    Closed,
}

impl EventStoreError {
    pub fn version_conflict(stream: &StreamKey, expected: u64, actual: u64) -> Self {
        Self::VersionConflict {
            stream: stream.to_string(),
            expected,
            actual,
        }
    }

    /// Lift a domain error raised while checking `stream`.
    pub fn from_domain(stream: &StreamKey, err: DomainError) -> Self {
        match err {
            DomainError::VersionConflict { expected, actual } => {
                Self::version_conflict(stream, expected, actual)
            }
            other => Self::InvalidEvent(other.to_string()),
        }
    }

    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

/// Durable, append-only storage of events (payloads as stored, i.e. with
/// sensitive leaves already encrypted).
///
/// ## Implementation requirements
///
/// - `insert` accepts an event only when `version == last_version + 1` for its
///   `(aggregate_id, aggregate_type)` stream and fails with `VersionConflict`
///   otherwise; the check and the write are atomic with respect to other inserts.
/// - Stored events are never updated or deleted.
/// - `load_stream` returns ascending `version`.
/// - `load_by_type` returns ascending `timestamp` (ties broken by event id).
/// - `load_by_aggregate_type` returns ascending `(aggregate_id, version)`.
#[async_trait]
pub trait EventRepository: Send + Sync {
    async fn insert(&self, event: &DomainEvent) -> Result<(), EventStoreError>;

    async fn load_stream(&self, stream: &StreamKey) -> Result<Vec<DomainEvent>, EventStoreError>;

    async fn load_by_type(
        &self,
        event_type: &str,
        page: Pagination,
    ) -> Result<Vec<DomainEvent>, EventStoreError>;

    async fn load_by_aggregate_type(
        &self,
        aggregate_type: &str,
        page: Pagination,
    ) -> Result<Vec<DomainEvent>, EventStoreError>;

    async fn get(&self, id: EventId) -> Result<Option<DomainEvent>, EventStoreError>;

    /// Last persisted version of `stream` (0 when empty).
    async fn stream_version(&self, stream: &StreamKey) -> Result<u64, EventStoreError>;

    /// Release connections. Further calls may fail.
    async fn close(&self) {}
}

#[async_trait]
impl<R> EventRepository for Arc<R>
where
    R: EventRepository + ?Sized,
{
    async fn insert(&self, event: &DomainEvent) -> Result<(), EventStoreError> {
        (**self).insert(event).await
    }

    async fn load_stream(&self, stream: &StreamKey) -> Result<Vec<DomainEvent>, EventStoreError> {
        (**self).load_stream(stream).await
    }

    async fn load_by_type(
        &self,
        event_type: &str,
        page: Pagination,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        (**self).load_by_type(event_type, page).await
    }

    async fn load_by_aggregate_type(
        &self,
        aggregate_type: &str,
        page: Pagination,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        (**self).load_by_aggregate_type(aggregate_type, page).await
    }

    async fn get(&self, id: EventId) -> Result<Option<DomainEvent>, EventStoreError> {
        (**self).get(id).await
    }

    async fn stream_version(&self, stream: &StreamKey) -> Result<u64, EventStoreError> {
        (**self).stream_version(stream).await
    }

    async fn close(&self) {
        (**self).close().await
    }
}
