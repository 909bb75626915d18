//! Domain events, their wire representation, and the message bus boundary.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod handler;
pub mod in_memory_bus;
pub mod topic;

pub use bus::{BusError, Consumer, Delivery, MessageBus, PublishReceipt};
pub use envelope::{BusMessage, headers};
pub use event::{DomainEvent, EventDraft, EventMetadata, RESERVED_METADATA_KEYS};
pub use handler::EventHandler;
pub use in_memory_bus::InMemoryMessageBus;
pub use topic::TopicRouter;
