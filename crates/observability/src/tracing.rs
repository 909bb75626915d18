//! Tracing/logging initialization.

use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per line.
    #[default]
    Json,
    /// Human-readable, for local runs and tests.
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingConfig {
    /// Filter used when `RUST_LOG` is unset or invalid.
    pub default_directive: String,
    pub format: LogFormat,
    /// Include span fields (e.g. `group_id` of a subscription) on each line.
    pub with_current_span: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            default_directive: "info".to_string(),
            format: LogFormat::Json,
            with_current_span: true,
        }
    }
}

impl TracingConfig {
    pub fn pretty() -> Self {
        Self {
            format: LogFormat::Pretty,
            ..Self::default()
        }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.default_directive))
    }
}

/// Initialize tracing for the process.
///
/// Returns `false` when a global subscriber was already installed.
pub fn init(config: &TracingConfig) -> bool {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(config.filter())
        .with_target(false);

    match config.format {
        LogFormat::Json => builder
            .json()
            .with_current_span(config.with_current_span)
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .try_init()
            .is_ok(),
        LogFormat::Pretty => builder.pretty().with_test_writer().try_init().is_ok(),
    }
}
