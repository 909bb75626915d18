//! Infrastructure layer: event store, persistence, locks, replay, config.

pub mod config;
pub mod event_store;
pub mod lock;
pub mod metrics;
pub mod replay;
pub mod runtime;

pub use crate::config::ChronicleConfig;
pub use event_store::{EventStore, EventStoreError, SubscribeOptions, SubscriptionHandle};
pub use lock::{DistributedLockManager, LockGrant};
pub use replay::{ReplayEngine, ReplayError};
pub use runtime::{EventSourcingRuntime, ShutdownContext};

mod integration_tests;
