use std::time::Duration;

use async_trait::async_trait;
use fleetgate_application::{DeploymentEvent, EventPublisher};
use fleetgate_core::{AppError, AppResult};
use tracing::debug;

/// Publishes deployment events as JSON webhooks with bounded retries.
#[derive(Clone)]
pub struct HttpEventPublisher {
    http_client: reqwest::Client,
    endpoint: String,
    max_attempts: u8,
    retry_backoff_ms: u64,
}

impl HttpEventPublisher {
    /// Creates a webhook publisher.
    #[must_use]
    pub fn new(
        http_client: reqwest::Client,
        endpoint: impl Into<String>,
        max_attempts: u8,
        retry_backoff_ms: u64,
    ) -> Self {
        Self {
            http_client,
            endpoint: endpoint.into(),
            max_attempts: max_attempts.max(1),
            retry_backoff_ms: retry_backoff_ms.max(50),
        }
    }
}

#[async_trait]
impl EventPublisher for HttpEventPublisher {
    async fn publish(&self, event: &DeploymentEvent) -> AppResult<()> {
        let mut attempt = 0_u8;
        let mut last_error: Option<String> = None;

        while attempt < self.max_attempts {
            attempt = attempt.saturating_add(1);
            let response = self
                .http_client
                .post(self.endpoint.as_str())
                .header("X-Fleetgate-Event", event.name())
                .header("X-Fleetgate-Tenant", event.tenant_id().to_string())
                .json(event)
                .send()
                .await;

            match response {
                Ok(response) if response.status().is_success() => {
                    debug!(event = event.name(), attempt, "published deployment event");
                    return Ok(());
                }
                Ok(response)
                    if response.status().is_server_error()
                        || response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS =>
                {
                    last_error = Some(format!(
                        "transient HTTP status {} for event '{}'",
                        response.status(),
                        event.name()
                    ));
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "<response body unavailable>".to_owned());
                    return Err(AppError::Internal(format!(
                        "event webhook rejected '{}' with status {status}: {body}",
                        event.name()
                    )));
                }
                Err(error) => {
                    last_error = Some(format!("event webhook transport error: {error}"));
                }
            }

            if attempt < self.max_attempts {
                let delay = self.retry_backoff_ms.saturating_mul(u64::from(attempt));
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }

        Err(AppError::Internal(last_error.unwrap_or_else(|| {
            "event webhook exhausted retries".to_owned()
        })))
    }
}
