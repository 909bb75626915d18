//! `chronicle-core` - stream identity and versioning primitives.
//!
//! This crate holds the pure building blocks shared by the event model, the
//! store and the replay engine (no IO, no async).

pub mod error;
pub mod id;
pub mod stream;

pub use error::{DomainError, DomainResult};
pub use id::{CorrelationId, EventId};
pub use stream::{StreamKey, StreamVersion};
