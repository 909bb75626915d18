//! Process-wide tracing setup shared by services and tests.

/// Install the default subscriber (JSON, `RUST_LOG` or `info`).
///
/// Safe to call multiple times; later calls are no-ops.
pub fn init() {
    tracing::init(&TracingConfig::default());
}

pub mod tracing;

pub use self::tracing::{LogFormat, TracingConfig};
