use chrono::Utc;
use fleetgate_core::{AppError, AppResult, TenantId};
use fleetgate_domain::{
    Action, ActionId, ActionStatus, ActionStatusUpdate, FeedbackContext, FeedbackOutcome,
};
use tracing::debug;

use crate::deployment_ports::{ActionStatusChange, DeferredEvents, DeploymentEvent};
use crate::retry::retry_on_conflict;

use super::ActionLifecycleService;

impl ActionLifecycleService {
    /// Applies controller feedback reported through the update channel.
    pub async fn add_status(
        &self,
        tenant_id: TenantId,
        action_id: ActionId,
        update: ActionStatusUpdate,
    ) -> AppResult<Action> {
        let (action, events) = retry_on_conflict(self.config.retry, "add_status", || {
            self.try_add_status(tenant_id, action_id, update.clone())
        })
        .await?;

        self.publish(events).await;
        Ok(action)
    }

    async fn try_add_status(
        &self,
        tenant_id: TenantId,
        action_id: ActionId,
        update: ActionStatusUpdate,
    ) -> AppResult<(Action, DeferredEvents)> {
        let mut action = self.load_action(tenant_id, action_id).await?;

        if action.is_informational_update(update.status) {
            self.enforce_status_quotas(tenant_id, &action, &update)
                .await?;
        }

        let mut target = self.load_target(tenant_id, action.controller_id()).await?;
        let other_active_actions = !self
            .other_active_actions(tenant_id, &action)
            .await?
            .is_empty();

        let outcome = action.apply_update_feedback(
            update.status,
            &mut target,
            FeedbackContext {
                now: Utc::now(),
                other_active_actions,
                record_closed_intermediate: !self.config.reject_status_for_closed_action,
            },
        )?;

        if !outcome.records_entry() {
            debug!(
                tenant_id = %tenant_id,
                action_id = %action_id,
                status = %update.status,
                "ignored feedback for closed action"
            );
            return Ok((action, DeferredEvents::new()));
        }

        let mut events = DeferredEvents::new();
        let target_changed = outcome.is_terminal();
        if outcome == FeedbackOutcome::Completed {
            events.push(DeploymentEvent::AttributesRequested {
                tenant_id,
                controller_id: action.controller_id().clone(),
            });
        }
        if target_changed {
            events.push(DeploymentEvent::AssignmentCompleted {
                tenant_id,
                controller_id: action.controller_id().clone(),
                action_id,
                status: action.status(),
                distribution_set_id: action.distribution_set_id(),
            });
        }

        let saved = self
            .actions
            .save_status_change(
                tenant_id,
                ActionStatusChange {
                    action,
                    entry: Some(update),
                    target: target_changed.then_some(target),
                },
            )
            .await?;

        Ok((saved, events))
    }

    /// Records that the controller retrieved the action.
    ///
    /// Consecutive retrievals produce a single history entry.
    pub async fn register_retrieved(
        &self,
        tenant_id: TenantId,
        action_id: ActionId,
        message: Option<String>,
    ) -> AppResult<Action> {
        retry_on_conflict(self.config.retry, "register_retrieved", || {
            self.try_register_retrieved(tenant_id, action_id, message.clone())
        })
        .await
    }

    async fn try_register_retrieved(
        &self,
        tenant_id: TenantId,
        action_id: ActionId,
        message: Option<String>,
    ) -> AppResult<Action> {
        let mut action = self.load_action(tenant_id, action_id).await?;

        let latest = self.actions.latest_status(tenant_id, action_id).await?;
        if latest.is_some_and(|entry| entry.status() == ActionStatus::Retrieved) {
            return Ok(action);
        }

        let now = Utc::now();
        action.apply_retrieved(now);

        let mut entry = ActionStatusUpdate::new(ActionStatus::Retrieved, now);
        if let Some(message) = message {
            entry = entry.with_message(message);
        }

        self.actions
            .save_status_change(
                tenant_id,
                ActionStatusChange {
                    action,
                    entry: Some(entry),
                    target: None,
                },
            )
            .await
    }

    async fn enforce_status_quotas(
        &self,
        tenant_id: TenantId,
        action: &Action,
        update: &ActionStatusUpdate,
    ) -> AppResult<()> {
        let config = self.config;

        if update.messages.len() > config.max_messages_per_entry {
            return Err(AppError::QuotaExceeded(format!(
                "status update for action '{}' carries {} messages, limit is {}",
                action.id(),
                update.messages.len(),
                config.max_messages_per_entry
            )));
        }

        if let Some(message) = update
            .messages
            .iter()
            .find(|message| message.chars().count() > config.max_message_length)
        {
            return Err(AppError::QuotaExceeded(format!(
                "status message for action '{}' has {} characters, limit is {}",
                action.id(),
                message.chars().count(),
                config.max_message_length
            )));
        }

        let entries = self
            .actions
            .count_status_entries(tenant_id, action.id())
            .await?;
        if entries >= config.max_status_entries_per_action {
            return Err(AppError::QuotaExceeded(format!(
                "action '{}' already holds {entries} status entries, limit is {}",
                action.id(),
                config.max_status_entries_per_action
            )));
        }

        Ok(())
    }
}
