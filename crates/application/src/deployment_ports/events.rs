use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetgate_core::{AppResult, TenantId};
use fleetgate_domain::{ActionId, ActionStatus, ControllerId, DistributionSetId};
use serde::Serialize;
use tracing::warn;

/// Deployment event published after the originating write commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeploymentEvent {
    /// A controller poll was persisted.
    PollObserved {
        /// Tenant.
        tenant_id: TenantId,
        /// Polling controller.
        controller_id: ControllerId,
        /// Persisted poll timestamp.
        polled_at: DateTime<Utc>,
    },
    /// The controller should push its attributes.
    AttributesRequested {
        /// Tenant.
        tenant_id: TenantId,
        /// Addressed controller.
        controller_id: ControllerId,
    },
    /// An action moved to canceling.
    CancelRequested {
        /// Tenant.
        tenant_id: TenantId,
        /// Target controller.
        controller_id: ControllerId,
        /// Canceled action.
        action_id: ActionId,
    },
    /// An action reached a terminal state.
    AssignmentCompleted {
        /// Tenant.
        tenant_id: TenantId,
        /// Target controller.
        controller_id: ControllerId,
        /// Closed action.
        action_id: ActionId,
        /// Final action status.
        status: ActionStatus,
        /// Distribution set of the action.
        distribution_set_id: DistributionSetId,
    },
    /// A new action was created.
    ActionCreated {
        /// Tenant.
        tenant_id: TenantId,
        /// Target controller.
        controller_id: ControllerId,
        /// Created action.
        action_id: ActionId,
        /// Assigned distribution set.
        distribution_set_id: DistributionSetId,
    },
}

impl DeploymentEvent {
    /// Returns the stable event name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::PollObserved { .. } => "poll_observed",
            Self::AttributesRequested { .. } => "attributes_requested",
            Self::CancelRequested { .. } => "cancel_requested",
            Self::AssignmentCompleted { .. } => "assignment_completed",
            Self::ActionCreated { .. } => "action_created",
        }
    }

    /// Returns the tenant the event belongs to.
    #[must_use]
    pub fn tenant_id(&self) -> TenantId {
        match self {
            Self::PollObserved { tenant_id, .. }
            | Self::AttributesRequested { tenant_id, .. }
            | Self::CancelRequested { tenant_id, .. }
            | Self::AssignmentCompleted { tenant_id, .. }
            | Self::ActionCreated { tenant_id, .. } => *tenant_id,
        }
    }
}

/// Fire-and-forget port for deployment events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publishes one event.
    async fn publish(&self, event: &DeploymentEvent) -> AppResult<()>;
}

/// Events collected during a unit of work and published after it commits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeferredEvents {
    events: Vec<DeploymentEvent>,
}

impl DeferredEvents {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues one event.
    pub fn push(&mut self, event: DeploymentEvent) {
        self.events.push(event);
    }

    /// Returns queued events.
    #[must_use]
    pub fn events(&self) -> &[DeploymentEvent] {
        &self.events
    }

    /// Returns true when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Publishes every queued event; failures are logged and skipped.
    pub async fn publish_all(self, publisher: &dyn EventPublisher) {
        for event in self.events {
            if let Err(error) = publisher.publish(&event).await {
                warn!(
                    tenant_id = %event.tenant_id(),
                    event = event.name(),
                    error = %error,
                    "failed to publish deployment event"
                );
            }
        }
    }
}
