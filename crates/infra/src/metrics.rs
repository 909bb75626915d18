//! Metrics sink used by the store and the replay engine.
//!
//! Counter and timer names are stable strings (`event_store.*`,
//! `event_replay.*`, `codec.*`); labels are free-form key/value pairs.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use metrics::Label;

pub mod names {
    pub const EVENTS_SAVED: &str = "event_store.events_saved";
    pub const SAVE_ERRORS: &str = "event_store.save_errors";
    pub const PUBLISH_FAILURES: &str = "event_store.publish_failures";
    pub const EVENTS_RETRIEVED: &str = "event_store.events_retrieved";
    pub const EVENTS_RETRIEVED_BY_TYPE: &str = "event_store.events_retrieved_by_type";
    pub const RETRIEVAL_ERRORS: &str = "event_store.retrieval_errors";
    pub const EVENT_PROCESSING_TIME: &str = "event_store.event_processing_time";
    pub const CONSUMER_ERRORS: &str = "event_store.consumer_errors";
    pub const SUBSCRIPTION_ERRORS: &str = "event_store.subscription_errors";
    pub const DECRYPTION_FAILURES: &str = "codec.decryption_failures";

    pub const AGGREGATE_REPLAY_TIME: &str = "event_replay.aggregate_replay_time";
    pub const FULL_REPLAY_TIME: &str = "event_replay.full_replay_time";
    pub const VIEW_REBUILD_TIME: &str = "event_replay.view_rebuild_time";
    pub const DISASTER_RECOVERY_TIME: &str = "event_replay.disaster_recovery_time";
    pub const REPLAY_ERRORS: &str = "event_replay.errors";
    pub const HANDLER_ERRORS: &str = "event_replay.handler_errors";
    pub const CONSISTENCY_CHECKS: &str = "event_replay.consistency_checks";
    pub const LOCK_RELEASE_ERRORS: &str = "event_replay.lock_release_errors";
}

/// Destination for counters and timers.
pub trait MetricsSink: Send + Sync {
    fn increment_counter(&self, name: &'static str, value: u64, labels: &[(&str, &str)]);

    fn record_timer(&self, name: &'static str, duration: Duration, labels: &[(&str, &str)]);
}

/// Forwards to whatever recorder is installed for the `metrics` facade
/// (a no-op until one is installed).
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsFacade;

fn to_labels(labels: &[(&str, &str)]) -> Vec<Label> {
    labels
        .iter()
        .map(|(k, v)| Label::new(k.to_string(), v.to_string()))
        .collect()
}

impl MetricsSink for MetricsFacade {
    fn increment_counter(&self, name: &'static str, value: u64, labels: &[(&str, &str)]) {
        metrics::counter!(name, to_labels(labels)).increment(value);
    }

    /// Timers are recorded as histograms in milliseconds.
    fn record_timer(&self, name: &'static str, duration: Duration, labels: &[(&str, &str)]) {
        metrics::histogram!(name, to_labels(labels)).record(duration.as_secs_f64() * 1000.0);
    }
}

/// Recording sink for tests. Labels are ignored; values are summed per name.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: Mutex<HashMap<&'static str, u64>>,
    timers: Mutex<HashMap<&'static str, Vec<Duration>>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str) -> u64 {
        let counters = self.counters.lock().unwrap_or_else(|p| p.into_inner());
        counters.get(name).copied().unwrap_or(0)
    }

    pub fn timer_samples(&self, name: &str) -> usize {
        let timers = self.timers.lock().unwrap_or_else(|p| p.into_inner());
        timers.get(name).map(Vec::len).unwrap_or(0)
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment_counter(&self, name: &'static str, value: u64, _labels: &[(&str, &str)]) {
        let mut counters = self.counters.lock().unwrap_or_else(|p| p.into_inner());
        *counters.entry(name).or_insert(0) += value;
    }

    fn record_timer(&self, name: &'static str, duration: Duration, _labels: &[(&str, &str)]) {
        let mut timers = self.timers.lock().unwrap_or_else(|p| p.into_inner());
        timers.entry(name).or_default().push(duration);
    }
}
