use chrono::Utc;
use fleetgate_core::{AppResult, TenantId};
use fleetgate_domain::{
    Action, ActionId, ActionStatus, ActionStatusUpdate, CANCELLATION_FINISHED_MESSAGE,
    FeedbackOutcome,
};
use tracing::info;

use crate::deployment_ports::{ActionStatusChange, DeferredEvents, DeploymentEvent};
use crate::retry::retry_on_conflict;

use super::ActionLifecycleService;

const FORCE_QUIT_MESSAGE: &str = "A force quit has been performed.";

impl ActionLifecycleService {
    /// Requests cancellation of an active action.
    pub async fn cancel(&self, tenant_id: TenantId, action_id: ActionId) -> AppResult<Action> {
        let (action, events) = retry_on_conflict(self.config.retry, "cancel", || {
            self.try_cancel(tenant_id, action_id)
        })
        .await?;

        self.publish(events).await;
        Ok(action)
    }

    async fn try_cancel(
        &self,
        tenant_id: TenantId,
        action_id: ActionId,
    ) -> AppResult<(Action, DeferredEvents)> {
        let mut action = self.load_action(tenant_id, action_id).await?;
        let now = Utc::now();
        action.request_cancel(now)?;

        let mut events = DeferredEvents::new();
        events.push(DeploymentEvent::CancelRequested {
            tenant_id,
            controller_id: action.controller_id().clone(),
            action_id,
        });

        let saved = self
            .actions
            .save_status_change(
                tenant_id,
                ActionStatusChange {
                    action,
                    entry: Some(ActionStatusUpdate::new(ActionStatus::Canceling, now)),
                    target: None,
                },
            )
            .await?;

        Ok((saved, events))
    }

    /// Applies controller feedback reported through the cancel channel.
    pub async fn add_cancel_status(
        &self,
        tenant_id: TenantId,
        action_id: ActionId,
        update: ActionStatusUpdate,
    ) -> AppResult<Action> {
        let (action, events) = retry_on_conflict(self.config.retry, "add_cancel_status", || {
            self.try_add_cancel_status(tenant_id, action_id, update.clone())
        })
        .await?;

        self.publish(events).await;
        Ok(action)
    }

    async fn try_add_cancel_status(
        &self,
        tenant_id: TenantId,
        action_id: ActionId,
        mut update: ActionStatusUpdate,
    ) -> AppResult<(Action, DeferredEvents)> {
        let mut action = self.load_action(tenant_id, action_id).await?;
        let mut target = self.load_target(tenant_id, action.controller_id()).await?;
        let next_assignment = self.next_assignment(tenant_id, &action).await?;

        let outcome =
            action.apply_cancel_feedback(update.status, &mut target, next_assignment, Utc::now())?;

        let mut events = DeferredEvents::new();
        if outcome == FeedbackOutcome::CancelConfirmed {
            update.messages.push(CANCELLATION_FINISHED_MESSAGE.to_owned());
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
                    target: (outcome == FeedbackOutcome::CancelConfirmed).then_some(target),
                },
            )
            .await?;

        Ok((saved, events))
    }

    /// Closes a canceling action without waiting for the controller.
    pub async fn force_quit(&self, tenant_id: TenantId, action_id: ActionId) -> AppResult<Action> {
        let (action, events) = retry_on_conflict(self.config.retry, "force_quit", || {
            self.try_force_quit(tenant_id, action_id)
        })
        .await?;

        info!(tenant_id = %tenant_id, action_id = %action_id, "force quit canceling action");
        self.publish(events).await;
        Ok(action)
    }

    async fn try_force_quit(
        &self,
        tenant_id: TenantId,
        action_id: ActionId,
    ) -> AppResult<(Action, DeferredEvents)> {
        let mut action = self.load_action(tenant_id, action_id).await?;
        let mut target = self.load_target(tenant_id, action.controller_id()).await?;
        let next_assignment = self.next_assignment(tenant_id, &action).await?;
        let now = Utc::now();

        action.force_quit(&mut target, next_assignment, now)?;

        let mut events = DeferredEvents::new();
        events.push(DeploymentEvent::AssignmentCompleted {
            tenant_id,
            controller_id: action.controller_id().clone(),
            action_id,
            status: action.status(),
            distribution_set_id: action.distribution_set_id(),
        });

        let saved = self
            .actions
            .save_status_change(
                tenant_id,
                ActionStatusChange {
                    action,
                    entry: Some(
                        ActionStatusUpdate::new(ActionStatus::Canceled, now)
                            .with_message(FORCE_QUIT_MESSAGE),
                    ),
                    target: Some(target),
                },
            )
            .await?;

        Ok((saved, events))
    }
}
