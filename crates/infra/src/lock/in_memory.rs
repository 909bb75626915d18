use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{DistributedLockManager, LockError, LockGrant, new_token};

#[derive(Debug, Clone)]
struct Held {
    token: String,
    expires_at: Instant,
}

/// Process-local lock manager.
///
/// Expiry follows tokio's clock, so tests can drive TTLs with
/// `tokio::time::pause`/`advance`.
#[derive(Debug, Default)]
pub struct InMemoryLockManager {
    locks: Mutex<HashMap<String, Held>>,
}

impl InMemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` is currently held (unexpired).
    pub async fn is_held(&self, key: &str) -> bool {
        let now = Instant::now();
        self.locks
            .lock()
            .await
            .get(key)
            .is_some_and(|held| held.expires_at > now)
    }
}

#[async_trait]
impl DistributedLockManager for InMemoryLockManager {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<LockGrant, LockError> {
        let now = Instant::now();
        let mut locks = self.locks.lock().await;

        if locks.get(key).is_some_and(|held| held.expires_at > now) {
            return Ok(LockGrant::denied());
        }

        let token = new_token();
        locks.insert(
            key.to_string(),
            Held {
                token: token.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(LockGrant::granted(token))
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut locks = self.locks.lock().await;

        match locks.get(key) {
            Some(held) if held.token == token => {
                let live = held.expires_at > now;
                locks.remove(key);
                Ok(live)
            }
            _ => Ok(false),
        }
    }
}
