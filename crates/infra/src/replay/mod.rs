//! Lock-protected replay of the event log.
//!
//! | Operation            | Lock key                         | Default TTL |
//! |----------------------|----------------------------------|-------------|
//! | `replay_aggregate`   | `replay:<aggregateType>:<id>`    | 5 minutes   |
//! | `replay_all_of_type` | `replay:<aggregateType>:all`     | 1 hour      |
//! | `rebuild_view`       | `view-rebuild:<viewName>`        | 1 hour      |
//! | `recover_all`        | `disaster-recovery`              | 24 hours    |
//! | `validate`           | none (read-only)                 |             |
//!
//! An expired lock may be taken over while the previous holder is still
//! running, so handlers must be idempotent.

pub mod consistency;
pub mod engine;
pub mod error;
pub mod report;

pub use consistency::{ConsistencyReport, Difference, json_differences};
pub use engine::ReplayEngine;
pub use error::ReplayError;
pub use report::{
    HandlerFailurePolicy, ProgressFn, RecoveryProgress, RecoveryProgressFn, RecoveryReport,
    RecoveryStep, ReplayProgress, ReplayReport, ReplayState, TypeReplayOptions,
};
