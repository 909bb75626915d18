//! Message bus abstraction (mechanics only).
//!
//! The bus is the **transport** for events after they have been persisted:
//!
//! ```text
//! append → EventRepository (durable) → MessageBus (publish) → Consumers
//! ```
//!
//! - **Topic + partition**: messages are routed to a topic, and within a topic to
//!   a partition chosen from the message key. One key always lands in one
//!   partition, so per-aggregate order is preserved on the wire.
//! - **Consumer groups**: a consumer reads on behalf of a group; committed
//!   offsets belong to the group, so a new consumer with the same group id
//!   resumes where the previous one stopped.
//! - **At-least-once delivery**: anything delivered but not yet committed is
//!   delivered again to the next consumer of the group. Consumers must be
//!   idempotent.
//! - **No storage guarantees**: the event store is the source of truth; a
//!   message that never made it onto the bus is still recoverable by replay.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::envelope::BusMessage;

/// Where a published message landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
}

/// A message handed to a consumer, with its log position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub message: BusMessage,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("message bus is closed")]
    Closed,

    #[error("bus transport error: {0}")]
    Transport(String),

    #[error("invalid consumer request: {0}")]
    InvalidRequest(String),
}

/// Topic-based publish/subscribe transport.
///
/// Implementations must be safe to share across tasks; publish may be called
/// concurrently from many producers.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, message: BusMessage) -> Result<PublishReceipt, BusError>;

    /// Open a consumer for `group_id` over `topics`.
    ///
    /// A group without committed offsets starts at the beginning of each
    /// partition when `from_beginning` is set, otherwise at the current end.
    async fn consumer(
        &self,
        group_id: &str,
        topics: &[String],
        from_beginning: bool,
    ) -> Result<Box<dyn Consumer>, BusError>;

    /// Stop accepting publishes and wake every consumer so it can exit.
    async fn close(&self) -> Result<(), BusError>;
}

/// A group member reading from one or more topics.
#[async_trait]
pub trait Consumer: Send {
    /// Wait up to `wait` for at most `max` deliveries.
    ///
    /// Returns an empty batch on timeout and `BusError::Closed` once the bus
    /// is shut down. Deliveries from one partition are in offset order.
    async fn poll(&mut self, max: usize, wait: Duration) -> Result<Vec<Delivery>, BusError>;

    /// Record `offset` (the last processed message) as done for the group.
    async fn commit(&mut self, topic: &str, partition: u32, offset: u64) -> Result<(), BusError>;

    async fn close(&mut self);
}

#[async_trait]
impl<B> MessageBus for Arc<B>
where
    B: MessageBus + ?Sized,
{
    async fn publish(&self, topic: &str, message: BusMessage) -> Result<PublishReceipt, BusError> {
        (**self).publish(topic, message).await
    }

    async fn consumer(
        &self,
        group_id: &str,
        topics: &[String],
        from_beginning: bool,
    ) -> Result<Box<dyn Consumer>, BusError> {
        (**self).consumer(group_id, topics, from_beginning).await
    }

    async fn close(&self) -> Result<(), BusError> {
        (**self).close().await
    }
}
