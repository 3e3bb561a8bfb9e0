use async_trait::async_trait;
use fleetgate_core::{AppResult, TenantId};

/// One tenant configuration value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValue {
    /// Boolean flag.
    Bool(bool),
    /// Integer value.
    Integer(i64),
    /// Free text value.
    Text(String),
}

/// Read-only port for tenant configuration values.
#[async_trait]
pub trait TenantConfiguration: Send + Sync {
    /// Returns the configured value or `None` when the key is unset.
    async fn get_value(&self, tenant_id: TenantId, key: &str) -> AppResult<Option<ConfigValue>>;
}

/// Port listing tenants for fleet-wide sweeps.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    /// Lists every tenant.
    async fn list_tenants(&self) -> AppResult<Vec<TenantId>>;
}
