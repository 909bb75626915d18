//! Domain error model.

use thiserror::Error;

/// Result type used by the pure stream primitives.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic failures (validation, stream continuity).
/// Infrastructure concerns belong to the store / bus / lock error types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. empty aggregate type).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A proposed version does not continue the stream.
    #[error("version conflict: expected version {expected}, got {actual}")]
    VersionConflict { expected: u64, actual: u64 },
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn version_conflict(expected: u64, actual: u64) -> Self {
        Self::VersionConflict { expected, actual }
    }
}
