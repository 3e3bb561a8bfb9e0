use std::sync::Arc;

use fleetgate_core::{AppError, AppResult, TenantId};
use fleetgate_domain::{
    Action, ActionId, ActionStatusEntry, ControllerId, DistributionSetId, Target,
};

use crate::deployment_ports::{
    ActionRepository, DeferredEvents, DistributionSetRepository, EventPublisher, TargetRepository,
};
use crate::retry::RetryPolicy;
use crate::tenant_settings::TenantSettings;

mod admin;
mod cancel;
mod feedback;
mod submit;

/// Limits and defaults of the action lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionLifecycleConfig {
    /// Maximum history entries per action for informational feedback.
    pub max_status_entries_per_action: u64,
    /// Maximum messages per history entry.
    pub max_messages_per_entry: usize,
    /// Maximum characters per message.
    pub max_message_length: usize,
    /// Maximum actions per target.
    pub max_actions_per_target: u64,
    /// Weight used for actions without one.
    pub default_weight: i32,
    /// Drops intermediate feedback for closed actions instead of recording it.
    pub reject_status_for_closed_action: bool,
    /// Retry settings for optimistic write conflicts.
    pub retry: RetryPolicy,
}

impl Default for ActionLifecycleConfig {
    fn default() -> Self {
        Self {
            max_status_entries_per_action: 1000,
            max_messages_per_entry: 50,
            max_message_length: 512,
            max_actions_per_target: 100,
            default_weight: 1000,
            reject_status_for_closed_action: false,
            retry: RetryPolicy::default(),
        }
    }
}

/// State machine service for deployment actions and their status history.
#[derive(Clone)]
pub struct ActionLifecycleService {
    targets: Arc<dyn TargetRepository>,
    actions: Arc<dyn ActionRepository>,
    distribution_sets: Arc<dyn DistributionSetRepository>,
    settings: TenantSettings,
    publisher: Arc<dyn EventPublisher>,
    config: ActionLifecycleConfig,
}

impl ActionLifecycleService {
    /// Creates an action lifecycle service.
    #[must_use]
    pub fn new(
        targets: Arc<dyn TargetRepository>,
        actions: Arc<dyn ActionRepository>,
        distribution_sets: Arc<dyn DistributionSetRepository>,
        settings: TenantSettings,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            targets,
            actions,
            distribution_sets,
            settings,
            publisher,
            config: ActionLifecycleConfig::default(),
        }
    }

    /// Overrides lifecycle limits and defaults.
    #[must_use]
    pub fn with_config(mut self, config: ActionLifecycleConfig) -> Self {
        self.config = config;
        self
    }

    /// Returns active actions of a target ordered by effective weight
    /// descending, then creation time and id ascending.
    pub async fn find_highest_weight_active_actions(
        &self,
        tenant_id: TenantId,
        controller_id: &ControllerId,
        limit: usize,
    ) -> AppResult<Vec<Action>> {
        let default_weight = self.config.default_weight;
        let mut actions = self
            .actions
            .list_active_actions(tenant_id, controller_id)
            .await?;

        actions.sort_by(|left, right| {
            right
                .effective_weight(default_weight)
                .cmp(&left.effective_weight(default_weight))
                .then_with(|| left.created_at().cmp(&right.created_at()))
                .then_with(|| left.id().cmp(&right.id()))
        });
        actions.truncate(limit);

        Ok(actions)
    }

    /// Returns the status history of an action, oldest first.
    pub async fn status_history(
        &self,
        tenant_id: TenantId,
        action_id: ActionId,
    ) -> AppResult<Vec<ActionStatusEntry>> {
        self.load_action(tenant_id, action_id).await?;
        self.actions.list_status_entries(tenant_id, action_id).await
    }

    async fn load_action(&self, tenant_id: TenantId, action_id: ActionId) -> AppResult<Action> {
        self.actions
            .find_action(tenant_id, action_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("action '{action_id}' does not exist")))
    }

    async fn load_target(
        &self,
        tenant_id: TenantId,
        controller_id: &ControllerId,
    ) -> AppResult<Target> {
        self.targets
            .find_target(tenant_id, controller_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("target '{controller_id}' does not exist"))
            })
    }

    /// Returns the active actions of the target other than `action_id`.
    async fn other_active_actions(
        &self,
        tenant_id: TenantId,
        action: &Action,
    ) -> AppResult<Vec<Action>> {
        let mut actions = self
            .actions
            .list_active_actions(tenant_id, action.controller_id())
            .await?;
        actions.retain(|candidate| candidate.id() != action.id());
        Ok(actions)
    }

    /// Distribution set of the newest remaining active action.
    async fn next_assignment(
        &self,
        tenant_id: TenantId,
        action: &Action,
    ) -> AppResult<Option<DistributionSetId>> {
        Ok(self
            .other_active_actions(tenant_id, action)
            .await?
            .into_iter()
            .max_by(|left, right| {
                left.created_at()
                    .cmp(&right.created_at())
                    .then_with(|| left.id().cmp(&right.id()))
            })
            .map(|newest| newest.distribution_set_id()))
    }

    async fn publish(&self, events: DeferredEvents) {
        events.publish_all(self.publisher.as_ref()).await;
    }
}

#[cfg(test)]
mod tests;
