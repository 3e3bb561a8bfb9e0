use chrono::Utc;
use fleetgate_core::{AppResult, TenantId};
use fleetgate_domain::{Action, ActionId};

use crate::deployment_ports::ActionStatusChange;
use crate::retry::retry_on_conflict;

use super::ActionLifecycleService;

impl ActionLifecycleService {
    /// Switches an active action to forced.
    pub async fn force_action(&self, tenant_id: TenantId, action_id: ActionId) -> AppResult<Action> {
        retry_on_conflict(self.config.retry, "force_action", || async move {
            let mut action = self.load_action(tenant_id, action_id).await?;
            if !action.force(Utc::now())? {
                return Ok(action);
            }

            self.save_action_only(tenant_id, action).await
        })
        .await
    }

    /// Replaces the external reference of an action.
    pub async fn update_external_ref(
        &self,
        tenant_id: TenantId,
        action_id: ActionId,
        external_ref: Option<String>,
    ) -> AppResult<Action> {
        retry_on_conflict(self.config.retry, "update_external_ref", || {
            let external_ref = external_ref.clone();
            async move {
                let mut action = self.load_action(tenant_id, action_id).await?;
                action.set_external_ref(external_ref, Utc::now());
                self.save_action_only(tenant_id, action).await
            }
        })
        .await
    }

    async fn save_action_only(&self, tenant_id: TenantId, action: Action) -> AppResult<Action> {
        self.actions
            .save_status_change(
                tenant_id,
                ActionStatusChange {
                    action,
                    entry: None,
                    target: None,
                },
            )
            .await
    }
}
