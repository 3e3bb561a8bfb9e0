use std::sync::Arc;
use std::time::Duration;

use fleetgate_core::{AppError, AppResult, TenantId};
use fleetgate_domain::ActionStatus;

use crate::deployment_ports::{ConfigValue, TenantConfiguration};

/// Allows several active assignments per target.
pub const MULTI_ASSIGNMENTS_ENABLED: &str = "multi.assignments.enabled";
/// Runs single-target auto assignment on polls and attribute updates.
pub const AUTO_ASSIGN_ON_POLL_ENABLED: &str = "auto.assign.on.poll.enabled";
/// Enables the action cleanup task.
pub const ACTION_CLEANUP_ENABLED: &str = "action.cleanup.enabled";
/// Age in milliseconds after which closed actions are deleted.
pub const ACTION_CLEANUP_EXPIRY_MS: &str = "action.cleanup.action_expiry_ms";
/// Comma separated statuses eligible for cleanup.
pub const ACTION_CLEANUP_STATUS: &str = "action.cleanup.action_status";
/// Enables the rollout cleanup task.
pub const ROLLOUT_CLEANUP_ENABLED: &str = "rollout.cleanup.enabled";

const DEFAULT_ACTION_EXPIRY: Duration = Duration::from_secs(30 * 24 * 60 * 60);
const DEFAULT_CLEANUP_STATUSES: [ActionStatus; 2] = [ActionStatus::Canceled, ActionStatus::Error];

/// Typed tenant settings with defaults.
#[derive(Clone)]
pub struct TenantSettings {
    configuration: Arc<dyn TenantConfiguration>,
}

impl TenantSettings {
    /// Creates typed settings over a configuration port.
    #[must_use]
    pub fn new(configuration: Arc<dyn TenantConfiguration>) -> Self {
        Self { configuration }
    }

    /// Returns whether several active assignments per target are allowed.
    pub async fn multi_assignments_enabled(&self, tenant_id: TenantId) -> AppResult<bool> {
        self.bool_or(tenant_id, MULTI_ASSIGNMENTS_ENABLED, false)
            .await
    }

    /// Returns whether polls trigger single-target auto assignment.
    pub async fn auto_assign_on_poll_enabled(&self, tenant_id: TenantId) -> AppResult<bool> {
        self.bool_or(tenant_id, AUTO_ASSIGN_ON_POLL_ENABLED, false)
            .await
    }

    /// Returns whether the action cleanup task runs.
    pub async fn action_cleanup_enabled(&self, tenant_id: TenantId) -> AppResult<bool> {
        self.bool_or(tenant_id, ACTION_CLEANUP_ENABLED, false).await
    }

    /// Returns the age after which closed actions are deleted.
    pub async fn action_cleanup_expiry(&self, tenant_id: TenantId) -> AppResult<Duration> {
        match self.value(tenant_id, ACTION_CLEANUP_EXPIRY_MS).await? {
            None => Ok(DEFAULT_ACTION_EXPIRY),
            Some(ConfigValue::Integer(millis)) => u64::try_from(millis)
                .map(Duration::from_millis)
                .map_err(|_| invalid_value(ACTION_CLEANUP_EXPIRY_MS, "must not be negative")),
            Some(ConfigValue::Text(text)) => text
                .trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| invalid_value(ACTION_CLEANUP_EXPIRY_MS, "must be milliseconds")),
            Some(ConfigValue::Bool(_)) => Err(invalid_value(
                ACTION_CLEANUP_EXPIRY_MS,
                "must be milliseconds",
            )),
        }
    }

    /// Returns the statuses eligible for action cleanup.
    pub async fn action_cleanup_statuses(
        &self,
        tenant_id: TenantId,
    ) -> AppResult<Vec<ActionStatus>> {
        match self.value(tenant_id, ACTION_CLEANUP_STATUS).await? {
            None => Ok(DEFAULT_CLEANUP_STATUSES.to_vec()),
            Some(ConfigValue::Text(text)) => text
                .split(',')
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::parse::<ActionStatus>)
                .collect(),
            Some(_) => Err(invalid_value(
                ACTION_CLEANUP_STATUS,
                "must be a comma separated status list",
            )),
        }
    }

    /// Returns whether the rollout cleanup task runs.
    pub async fn rollout_cleanup_enabled(&self, tenant_id: TenantId) -> AppResult<bool> {
        self.bool_or(tenant_id, ROLLOUT_CLEANUP_ENABLED, true).await
    }

    async fn value(&self, tenant_id: TenantId, key: &str) -> AppResult<Option<ConfigValue>> {
        self.configuration.get_value(tenant_id, key).await
    }

    async fn bool_or(&self, tenant_id: TenantId, key: &str, default: bool) -> AppResult<bool> {
        match self.value(tenant_id, key).await? {
            None => Ok(default),
            Some(ConfigValue::Bool(value)) => Ok(value),
            Some(ConfigValue::Text(text)) => match text.trim().to_ascii_lowercase().as_str() {
                "true" => Ok(true),
                "false" => Ok(false),
                _ => Err(invalid_value(key, "must be a boolean")),
            },
            Some(ConfigValue::Integer(_)) => Err(invalid_value(key, "must be a boolean")),
        }
    }
}

fn invalid_value(key: &str, reason: &str) -> AppError {
    AppError::Validation(format!("tenant configuration '{key}' {reason}"))
}
