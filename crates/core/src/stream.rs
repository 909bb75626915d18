//! Event stream identity and version continuity.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Identifies one aggregate's event stream: `(aggregate_id, aggregate_type)`.
///
/// The same `aggregate_id` under two different aggregate types names two
/// independent streams.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamKey {
    pub aggregate_id: String,
    pub aggregate_type: String,
}

impl StreamKey {
    pub fn new(aggregate_id: impl Into<String>, aggregate_type: impl Into<String>) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            aggregate_type: aggregate_type.into(),
        }
    }

    /// Reject empty identifiers before they reach storage.
    pub fn validate(&self) -> DomainResult<()> {
        if self.aggregate_id.trim().is_empty() {
            return Err(DomainError::validation("aggregate_id must not be empty"));
        }
        if self.aggregate_type.trim().is_empty() {
            return Err(DomainError::validation("aggregate_type must not be empty"));
        }
        Ok(())
    }
}

impl core::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.aggregate_type, self.aggregate_id)
    }
}

/// Last persisted version of a stream (0 = empty stream).
///
/// Versions are gap-free: the only acceptable next version is `current + 1`.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamVersion(u64);

impl StreamVersion {
    pub const EMPTY: StreamVersion = StreamVersion(0);

    pub fn new(version: u64) -> Self {
        Self(version)
    }

    pub fn next(self) -> u64 {
        self.0 + 1
    }

    pub fn accepts(self, proposed: u64) -> bool {
        proposed == self.next()
    }

    /// Fails with `VersionConflict` unless `proposed` continues the stream.
    pub fn check_next(self, proposed: u64) -> DomainResult<()> {
        if self.accepts(proposed) {
            Ok(())
        } else {
            Err(DomainError::version_conflict(self.next(), proposed))
        }
    }
}
