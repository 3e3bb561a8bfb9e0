//! Periodic, lock-guarded cleanup runner.
//!
//! Every tick walks each tenant and each registered [`CleanupTask`]. A task
//! runs only while its `cleanup:<task>:<tenant>` lock is held, so at most one
//! node executes a given task for a given tenant at a time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleetgate_core::{AppResult, ExecutionContext};
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::deployment_ports::{DistributedLock, LockKey, TenantDirectory, run_exclusive};

mod action_cleanup;
mod rollout_cleanup;

pub use action_cleanup::ActionCleanupTask;
pub use rollout_cleanup::RolloutCleanupTask;

/// One pluggable housekeeping task.
#[async_trait]
pub trait CleanupTask: Send + Sync {
    /// Stable task id used in lock keys and logs.
    fn id(&self) -> &str;

    /// Runs the task for the tenant of `context`.
    async fn run(&self, context: &ExecutionContext) -> AppResult<()>;
}

/// Counters of one scheduler tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupTickReport {
    /// Task runs that completed.
    pub ran: usize,
    /// Task runs skipped because the lock was held elsewhere.
    pub skipped: usize,
    /// Task runs that failed.
    pub failed: usize,
}

/// Runs cleanup tasks for every tenant on a fixed interval.
pub struct CleanupScheduler {
    tasks: Vec<Arc<dyn CleanupTask>>,
    tenants: Arc<dyn TenantDirectory>,
    lock: Arc<dyn DistributedLock>,
    interval: Duration,
    shutdown: Arc<Notify>,
}

impl CleanupScheduler {
    /// Creates a scheduler without tasks.
    #[must_use]
    pub fn new(
        tenants: Arc<dyn TenantDirectory>,
        lock: Arc<dyn DistributedLock>,
        interval: Duration,
    ) -> Self {
        Self {
            tasks: Vec::new(),
            tenants,
            lock,
            interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Appends a task; tasks run in registration order.
    #[must_use]
    pub fn with_task(mut self, task: Arc<dyn CleanupTask>) -> Self {
        self.tasks.push(task);
        self
    }

    /// Returns a handle that stops [`CleanupScheduler::run`].
    #[must_use]
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Runs a tick on every interval until shutdown is signalled.
    pub async fn run(self) {
        info!(
            interval_secs = self.interval.as_secs(),
            tasks = self.tasks.len(),
            "cleanup scheduler started"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => {
                    info!("cleanup scheduler stopped");
                    break;
                }
                _ = tokio::time::sleep(self.interval) => {
                    match self.run_tick().await {
                        Ok(report) => debug!(
                            ran = report.ran,
                            skipped = report.skipped,
                            failed = report.failed,
                            "cleanup tick finished"
                        ),
                        Err(error) => error!(error = %error, "cleanup tick failed"),
                    }
                }
            }
        }
    }

    /// Runs every task for every tenant once.
    pub async fn run_tick(&self) -> AppResult<CleanupTickReport> {
        let mut report = CleanupTickReport::default();

        for tenant_id in self.tenants.list_tenants().await? {
            let context = ExecutionContext::system(tenant_id);

            for task in &self.tasks {
                let key = LockKey::cleanup(task.id(), tenant_id);
                let outcome =
                    run_exclusive(self.lock.as_ref(), &key, || task.run(&context)).await;

                match outcome {
                    Ok(Some(())) => report.ran += 1,
                    Ok(None) => {
                        report.skipped += 1;
                        debug!(
                            tenant_id = %tenant_id,
                            task = task.id(),
                            "cleanup lock held elsewhere; task skipped"
                        );
                    }
                    Err(error) => {
                        report.failed += 1;
                        error!(
                            tenant_id = %tenant_id,
                            task = task.id(),
                            error = %error,
                            "cleanup task failed"
                        );
                    }
                }
            }
        }

        Ok(report)
    }
}
