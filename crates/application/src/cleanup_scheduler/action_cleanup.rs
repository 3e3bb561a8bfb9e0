use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use fleetgate_core::{AppError, AppResult, ExecutionContext};
use tracing::info;

use crate::deployment_ports::ActionRepository;
use crate::tenant_settings::TenantSettings;

use super::CleanupTask;

/// Deletes closed actions in configured statuses once they expire.
pub struct ActionCleanupTask {
    actions: Arc<dyn ActionRepository>,
    settings: TenantSettings,
    batch_size: usize,
}

impl ActionCleanupTask {
    /// Task id used in lock keys.
    pub const ID: &'static str = "action-cleanup";

    /// Creates the task with a default batch size of 1000.
    #[must_use]
    pub fn new(actions: Arc<dyn ActionRepository>, settings: TenantSettings) -> Self {
        Self {
            actions,
            settings,
            batch_size: 1000,
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
impl CleanupTask for ActionCleanupTask {
    fn id(&self) -> &str {
        Self::ID
    }

    async fn run(&self, context: &ExecutionContext) -> AppResult<()> {
        let tenant_id = context.tenant_id();
        if !self.settings.action_cleanup_enabled(tenant_id).await? {
            return Ok(());
        }

        let statuses = self.settings.action_cleanup_statuses(tenant_id).await?;
        if statuses.is_empty() {
            return Ok(());
        }

        let expiry = self.settings.action_cleanup_expiry(tenant_id).await?;
        let expiry = TimeDelta::from_std(expiry).map_err(|error| {
            AppError::Validation(format!("action cleanup expiry is out of range: {error}"))
        })?;
        let modified_before = Utc::now().checked_sub_signed(expiry).ok_or_else(|| {
            AppError::Validation("action cleanup expiry is out of range".to_owned())
        })?;

        let mut deleted = 0;
        loop {
            let batch = self
                .actions
                .delete_inactive_actions(tenant_id, &statuses, modified_before, self.batch_size)
                .await?;
            deleted += batch;

            if batch < self.batch_size as u64 {
                break;
            }
        }

        if deleted > 0 {
            info!(tenant_id = %tenant_id, deleted, "deleted expired actions");
        }
        Ok(())
    }
}
