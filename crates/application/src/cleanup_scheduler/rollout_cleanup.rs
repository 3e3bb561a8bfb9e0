use std::sync::Arc;

use async_trait::async_trait;
use fleetgate_core::{AppResult, ExecutionContext};
use tracing::info;

use crate::deployment_ports::RolloutRepository;
use crate::tenant_settings::TenantSettings;

use super::CleanupTask;

/// Deletes soft-deleted rollouts once their actions are gone.
pub struct RolloutCleanupTask {
    rollouts: Arc<dyn RolloutRepository>,
    settings: TenantSettings,
    batch_size: usize,
}

impl RolloutCleanupTask {
    /// Task id used in lock keys.
    pub const ID: &'static str = "rollout-cleanup";

    /// Creates the task with a default batch size of 100.
    #[must_use]
    pub fn new(rollouts: Arc<dyn RolloutRepository>, settings: TenantSettings) -> Self {
        Self {
            rollouts,
            settings,
            batch_size: 100,
        }
    }

    /// Overrides the delete batch size.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

#[async_trait]
impl CleanupTask for RolloutCleanupTask {
    fn id(&self) -> &str {
        Self::ID
    }

    async fn run(&self, context: &ExecutionContext) -> AppResult<()> {
        let tenant_id = context.tenant_id();
        if !self.settings.rollout_cleanup_enabled(tenant_id).await? {
            return Ok(());
        }

        let mut deleted = 0;
        loop {
            let batch = self
                .rollouts
                .delete_soft_deleted_rollouts(tenant_id, self.batch_size)
                .await?;
            deleted += batch;

            if batch < self.batch_size as u64 {
                break;
            }
        }

        if deleted > 0 {
            info!(tenant_id = %tenant_id, deleted, "deleted soft deleted rollouts");
        }
        Ok(())
    }
}
