//! Redis-backed lock manager (`SET NX PX` plus compare-and-delete).

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tracing::{debug, instrument};

use super::{DistributedLockManager, LockError, LockGrant, new_token};

/// Delete the key only if it still holds our token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const KEY_PREFIX: &str = "chronicle:lock:";

#[derive(Clone)]
pub struct RedisLockManager {
    conn: MultiplexedConnection,
    release: redis::Script,
}

impl core::fmt::Debug for RedisLockManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisLockManager").finish_non_exhaustive()
    }
}

impl RedisLockManager {
    /// Connect to `redis_url` (e.g. `redis://localhost:6379`).
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, LockError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(backend)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(backend)?;
        Ok(Self {
            conn,
            release: redis::Script::new(RELEASE_SCRIPT),
        })
    }
}

fn backend(e: redis::RedisError) -> LockError {
    LockError::Backend(e.to_string())
}

#[async_trait]
impl DistributedLockManager for RedisLockManager {
    #[instrument(skip(self), err)]
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<LockGrant, LockError> {
        let token = new_token();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let mut conn = self.conn.clone();

        let reply: Option<String> = redis::cmd("SET")
            .arg(format!("{KEY_PREFIX}{key}"))
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;

        if reply.is_some() {
            debug!(key, "lock acquired");
            Ok(LockGrant::granted(token))
        } else {
            Ok(LockGrant::denied())
        }
    }

    #[instrument(skip(self, token), err)]
    async fn release(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release
            .key(format!("{KEY_PREFIX}{key}"))
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(deleted == 1)
    }
}
