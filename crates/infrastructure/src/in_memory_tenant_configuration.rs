use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use fleetgate_application::{ConfigValue, TenantConfiguration, TenantDirectory};
use fleetgate_core::{AppResult, TenantId};
use tokio::sync::RwLock;

/// In-memory tenant configuration store and tenant directory.
#[derive(Debug, Default)]
pub struct InMemoryTenantConfiguration {
    values: RwLock<HashMap<(TenantId, String), ConfigValue>>,
    tenants: RwLock<BTreeSet<TenantId>>,
}

impl InMemoryTenantConfiguration {
    /// Creates an empty configuration store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tenant for fleet-wide sweeps.
    pub async fn register_tenant(&self, tenant_id: TenantId) {
        self.tenants.write().await.insert(tenant_id);
    }

    /// Sets one configuration value and registers the tenant.
    pub async fn set_value(&self, tenant_id: TenantId, key: impl Into<String>, value: ConfigValue) {
        self.register_tenant(tenant_id).await;
        self.values
            .write()
            .await
            .insert((tenant_id, key.into()), value);
    }
}

#[async_trait]
impl TenantConfiguration for InMemoryTenantConfiguration {
    async fn get_value(&self, tenant_id: TenantId, key: &str) -> AppResult<Option<ConfigValue>> {
        Ok(self
            .values
            .read()
            .await
            .get(&(tenant_id, key.to_owned()))
            .cloned())
    }
}

#[async_trait]
impl TenantDirectory for InMemoryTenantConfiguration {
    async fn list_tenants(&self) -> AppResult<Vec<TenantId>> {
        Ok(self.tenants.read().await.iter().copied().collect())
    }
}
