use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

/// Lifecycle of one lock-protected replay unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayState {
    Idle,
    LockAcquired,
    Running,
    Completed,
    Failed,
    LockReleased,
}

/// What a replay does when the handler fails on one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HandlerFailurePolicy {
    /// Log, count and move on to the next event.
    #[default]
    Continue,
    /// Stop the unit and return `ReplayError::Handler`.
    Abort,
}

/// Outcome of a replay unit that ran to the end.
///
/// `final_state` is always the state the unit finished its run in, so a
/// unit that skipped past handler failures is `Completed` with `failed > 0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    /// Events handed to the handler.
    pub processed: u64,
    /// Of those, how many the handler rejected.
    pub failed: u64,
    pub duration: Duration,
    pub final_state: ReplayState,
}

impl ReplayReport {
    pub(crate) fn new(processed: u64, failed: u64, duration: Duration) -> Self {
        Self {
            processed,
            failed,
            duration,
            final_state: ReplayState::Completed,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

/// Emitted after each page of a bulk type replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayProgress {
    pub aggregate_type: String,
    /// Cumulative events handled so far.
    pub processed: u64,
}

pub type ProgressFn = Arc<dyn Fn(&ReplayProgress) + Send + Sync>;

/// Options of `replay_all_of_type`.
#[derive(Clone, Default)]
pub struct TypeReplayOptions {
    /// Page size; the engine's configured `batch_size` when absent.
    pub batch_size: Option<u32>,
    pub on_progress: Option<ProgressFn>,
    pub policy: HandlerFailurePolicy,
}

impl core::fmt::Debug for TypeReplayOptions {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TypeReplayOptions")
            .field("batch_size", &self.batch_size)
            .field("on_progress", &self.on_progress.is_some())
            .field("policy", &self.policy)
            .finish()
    }
}

impl TypeReplayOptions {
    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn with_progress(mut self, on_progress: impl Fn(&ReplayProgress) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(on_progress));
        self
    }

    pub fn with_policy(mut self, policy: HandlerFailurePolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStep {
    Start,
    Progress,
    Complete,
    /// No handler was registered for the type.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryProgress {
    pub step: RecoveryStep,
    pub aggregate_type: String,
    pub processed: u64,
}

pub type RecoveryProgressFn = Arc<dyn Fn(&RecoveryProgress) + Send + Sync>;

/// Outcome of a disaster recovery in which every handled type succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Per-type reports, in recovery order.
    pub per_type: Vec<(String, ReplayReport)>,
    pub skipped: Vec<String>,
    pub duration: Duration,
}

impl RecoveryReport {
    pub fn total_processed(&self) -> u64 {
        self.per_type.iter().map(|(_, r)| r.processed).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skipped_failures_keep_the_completed_state() {
        let clean = ReplayReport::new(4, 0, Duration::from_millis(3));
        assert_eq!(clean.final_state, ReplayState::Completed);
        assert!(clean.is_clean());

        let partial = ReplayReport::new(4, 1, Duration::from_millis(3));
        assert_eq!(partial.final_state, ReplayState::Completed);
        assert!(!partial.is_clean());
    }

    #[test]
    fn progress_steps_serialize_snake_case() {
        let progress = RecoveryProgress {
            step: RecoveryStep::Skipped,
            aggregate_type: "encounter".to_string(),
            processed: 0,
        };
        let json = serde_json::to_value(&progress).unwrap();
        assert_eq!(json["step"], "skipped");
    }
}
