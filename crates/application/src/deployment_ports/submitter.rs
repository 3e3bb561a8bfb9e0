use async_trait::async_trait;
use fleetgate_core::{AppResult, TenantId};
use fleetgate_domain::{
    Action, ActionType, ControllerId, DistributionSetId, MaintenanceWindow,
};

/// Request to deploy one distribution set to one target.
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentRequest {
    /// Target controller.
    pub controller_id: ControllerId,
    /// Distribution set to deploy.
    pub distribution_set_id: DistributionSetId,
    /// Action type.
    pub action_type: ActionType,
    /// Optional weight.
    pub weight: Option<i32>,
    /// Optional maintenance window.
    pub maintenance_window: Option<MaintenanceWindow>,
    /// Optional initiator.
    pub initiated_by: Option<String>,
}

impl DeploymentRequest {
    /// Creates a request without weight, window or initiator.
    #[must_use]
    pub fn new(
        controller_id: ControllerId,
        distribution_set_id: DistributionSetId,
        action_type: ActionType,
    ) -> Self {
        Self {
            controller_id,
            distribution_set_id,
            action_type,
            weight: None,
            maintenance_window: None,
            initiated_by: None,
        }
    }
}

/// Outcome of one submission batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeploymentResult {
    /// Newly created actions.
    pub assigned: Vec<Action>,
    /// Requests skipped because an equivalent action is already active.
    pub already_assigned: Vec<(ControllerId, DistributionSetId)>,
}

/// Port accepting deployment requests.
#[async_trait]
pub trait DeploymentSubmitter: Send + Sync {
    /// Validates and submits a batch as one atomic write.
    async fn submit(
        &self,
        tenant_id: TenantId,
        requests: Vec<DeploymentRequest>,
    ) -> AppResult<DeploymentResult>;
}
