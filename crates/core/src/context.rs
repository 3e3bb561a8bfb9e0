use serde::{Deserialize, Serialize};

use crate::TenantId;

/// Tenant-scoped context handed to scheduled housekeeping work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    tenant_id: TenantId,
}

impl ExecutionContext {
    /// Creates a system context scoped to one tenant.
    #[must_use]
    pub fn system(tenant_id: TenantId) -> Self {
        Self { tenant_id }
    }

    /// Returns the tenant the context is bound to.
    #[must_use]
    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}
