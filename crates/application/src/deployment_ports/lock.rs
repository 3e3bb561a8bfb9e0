use std::fmt::{Display, Formatter};
use std::future::Future;

use async_trait::async_trait;
use fleetgate_core::{AppResult, TenantId};
use tracing::warn;

/// Name of a distributed lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey(String);

impl LockKey {
    /// Wraps an arbitrary lock name.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Tenant-scoped auto-assignment lock.
    #[must_use]
    pub fn auto_assign(tenant_id: TenantId) -> Self {
        Self(format!("{tenant_id}:autoassign"))
    }

    /// Lock guarding one cleanup task for one tenant.
    #[must_use]
    pub fn cleanup(task_id: &str, tenant_id: TenantId) -> Self {
        Self(format!("cleanup:{task_id}:{tenant_id}"))
    }

    /// Returns the lock name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for LockKey {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.0.as_str())
    }
}

/// One held lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    /// Lock name.
    pub key: LockKey,
    /// Token used for compare-and-delete release.
    pub token: String,
}

/// Distributed coordination port for tenant-scoped locks.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Attempts to acquire the lock without waiting.
    async fn try_acquire(&self, key: &LockKey) -> AppResult<Option<LockLease>>;

    /// Releases the lock when the token still owns it.
    async fn release(&self, lease: &LockLease) -> AppResult<()>;
}

/// Runs `work` while holding `key`.
///
/// Returns `Ok(None)` without running `work` when the lock is held elsewhere.
/// The lock is released whether `work` succeeds or fails.
pub async fn run_exclusive<T, F, Fut>(
    lock: &dyn DistributedLock,
    key: &LockKey,
    work: F,
) -> AppResult<Option<T>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let Some(lease) = lock.try_acquire(key).await? else {
        return Ok(None);
    };

    let result = work().await;

    if let Err(error) = lock.release(&lease).await {
        warn!(lock_key = %key, error = %error, "failed to release distributed lock");
    }

    result.map(Some)
}
