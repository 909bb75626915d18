//! Distributed mutual exclusion for replay work.
//!
//! A lock is a key with an owner token and a TTL. Acquire succeeds only when
//! the key is free or its previous holder's TTL has lapsed; release succeeds
//! only for the token that acquired it. A crashed holder therefore blocks
//! others for at most one TTL.

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use in_memory::InMemoryLockManager;
#[cfg(feature = "redis")]
pub use self::redis::RedisLockManager;

/// Result of an acquire attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGrant {
    pub granted: bool,
    /// Owner token, present only when granted.
    pub token: Option<String>,
}

impl LockGrant {
    pub fn granted(token: impl Into<String>) -> Self {
        Self {
            granted: true,
            token: Some(token.into()),
        }
    }

    pub fn denied() -> Self {
        Self {
            granted: false,
            token: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait DistributedLockManager: Send + Sync {
    /// Try once (no waiting) to take `key` for `ttl`.
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<LockGrant, LockError>;

    /// Release `key` if it is still held by `token`.
    ///
    /// Returns `false` when the lock had expired or belongs to someone else.
    async fn release(&self, key: &str, token: &str) -> Result<bool, LockError>;
}

#[async_trait]
impl<L> DistributedLockManager for Arc<L>
where
    L: DistributedLockManager + ?Sized,
{
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<LockGrant, LockError> {
        (**self).acquire(key, ttl).await
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, LockError> {
        (**self).release(key, token).await
    }
}

pub(crate) fn new_token() -> String {
    uuid::Uuid::now_v7().to_string()
}
