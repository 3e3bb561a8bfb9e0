use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use fleetgate_application::{DistributedLock, LockKey, LockLease};
use fleetgate_core::AppResult;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct HeldLock {
    token: String,
    expires_at: Instant,
}

/// Process-local lock adapter with lease expiry, for tests and single-node runs.
#[derive(Debug)]
pub struct InMemoryDistributedLock {
    ttl: Duration,
    held: Mutex<HashMap<String, HeldLock>>,
}

impl InMemoryDistributedLock {
    /// Creates a lock whose leases expire after `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            held: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl DistributedLock for InMemoryDistributedLock {
    async fn try_acquire(&self, key: &LockKey) -> AppResult<Option<LockLease>> {
        let now = Instant::now();
        let mut held = self.held.lock().await;

        if held
            .get(key.as_str())
            .is_some_and(|lock| lock.expires_at > now)
        {
            return Ok(None);
        }

        let token = Uuid::new_v4().to_string();
        held.insert(
            key.as_str().to_owned(),
            HeldLock {
                token: token.clone(),
                expires_at: now.checked_add(self.ttl).unwrap_or(now),
            },
        );

        Ok(Some(LockLease {
            key: key.clone(),
            token,
        }))
    }

    async fn release(&self, lease: &LockLease) -> AppResult<()> {
        let mut held = self.held.lock().await;
        if held
            .get(lease.key.as_str())
            .is_some_and(|lock| lock.token == lease.token)
        {
            held.remove(lease.key.as_str());
        }

        Ok(())
    }
}
