use async_trait::async_trait;
use fleetgate_application::{DeploymentEvent, EventPublisher};
use fleetgate_core::{AppError, AppResult};
use tracing::info;

/// Event publisher that writes each event as one structured log line.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventPublisher;

impl TracingEventPublisher {
    /// Creates the publisher.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EventPublisher for TracingEventPublisher {
    async fn publish(&self, event: &DeploymentEvent) -> AppResult<()> {
        let payload = serde_json::to_string(event).map_err(|error| {
            AppError::Internal(format!("failed to serialize deployment event: {error}"))
        })?;

        info!(
            tenant_id = %event.tenant_id(),
            event = event.name(),
            payload = %payload,
            "deployment event"
        );
        Ok(())
    }
}
