//! Append-only event store.
//!
//! ```text
//! append → seal (codec) → EventRepository (durable) → MessageBus (publish)
//! subscribe ← open (codec) ← subscription worker ← Consumer
//! ```
//!
//! Ordering invariant: **publish happens only after the repository accepted
//! the event**. A failed publish does not roll the event back; consumers that
//! missed it catch up through replay.

pub mod in_memory;
pub mod postgres;
pub mod query;
pub mod store;
pub mod subscription;
pub mod r#trait;

pub use in_memory::InMemoryEventRepository;
pub use postgres::PostgresEventRepository;
pub use query::Pagination;
pub use store::{EventStore, StoreSettings, SubscribeOptions};
pub use subscription::{SubscriptionHandle, SubscriptionStats};
pub use r#trait::{EventRepository, EventStoreError};
