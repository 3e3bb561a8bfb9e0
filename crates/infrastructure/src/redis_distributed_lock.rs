//! Redis-backed distributed lock shared by every control plane node.

use async_trait::async_trait;
use fleetgate_application::{DistributedLock, LockKey, LockLease};
use fleetgate_core::{AppError, AppResult};
use redis::Script;
use redis::aio::ConnectionManager;

const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
else
  return 0
end
"#;

/// Redis implementation of the distributed lock.
///
/// Acquisition is a single `SET NX EX`; release deletes the key only while the
/// stored token still matches.
#[derive(Clone)]
pub struct RedisDistributedLock {
    connection: ConnectionManager,
    key_prefix: String,
    lease_seconds: u32,
}

impl RedisDistributedLock {
    /// Connects a lock adapter; leases expire after `lease_seconds`.
    pub async fn connect(
        client: redis::Client,
        key_prefix: impl Into<String>,
        lease_seconds: u32,
    ) -> AppResult<Self> {
        if lease_seconds == 0 {
            return Err(AppError::Validation(
                "distributed lock lease_seconds must be greater than zero".to_owned(),
            ));
        }

        let connection = ConnectionManager::new(client)
            .await
            .map_err(|error| AppError::Internal(format!("failed to connect to redis: {error}")))?;

        Ok(Self {
            connection,
            key_prefix: key_prefix.into(),
            lease_seconds,
        })
    }

    fn key_for(&self, key: &LockKey) -> String {
        format!("{}:{key}", self.key_prefix)
    }
}

#[async_trait]
impl DistributedLock for RedisDistributedLock {
    async fn try_acquire(&self, key: &LockKey) -> AppResult<Option<LockLease>> {
        let redis_key = self.key_for(key);
        let token = uuid::Uuid::new_v4().to_string();
        let mut connection = self.connection.clone();

        let reply: Option<String> = redis::cmd("SET")
            .arg(redis_key.as_str())
            .arg(token.as_str())
            .arg("NX")
            .arg("EX")
            .arg(self.lease_seconds)
            .query_async(&mut connection)
            .await
            .map_err(|error| {
                AppError::Internal(format!("failed to acquire lock '{key}': {error}"))
            })?;

        if reply.is_none() {
            return Ok(None);
        }

        Ok(Some(LockLease {
            key: key.clone(),
            token,
        }))
    }

    async fn release(&self, lease: &LockLease) -> AppResult<()> {
        let mut connection = self.connection.clone();

        Script::new(RELEASE_LOCK_SCRIPT)
            .key(self.key_for(&lease.key))
            .arg(lease.token.as_str())
            .invoke_async::<i32>(&mut connection)
            .await
            .map_err(|error| {
                AppError::Internal(format!("failed to release lock '{}': {error}", lease.key))
            })?;

        Ok(())
    }
}
