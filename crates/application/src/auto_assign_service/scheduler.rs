use std::sync::Arc;
use std::time::Duration;

use fleetgate_core::AppResult;
use tokio::sync::Notify;
use tracing::{error, info};

use crate::deployment_ports::TenantDirectory;

use super::AutoAssignService;

/// Periodic fleet-wide auto-assignment sweep over every tenant.
pub struct AutoAssignScheduler {
    service: AutoAssignService,
    tenants: Arc<dyn TenantDirectory>,
    interval: Duration,
    shutdown: Arc<Notify>,
}

impl AutoAssignScheduler {
    /// Creates a scheduler running on a fixed interval.
    #[must_use]
    pub fn new(
        service: AutoAssignService,
        tenants: Arc<dyn TenantDirectory>,
        interval: Duration,
    ) -> Self {
        Self {
            service,
            tenants,
            interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Returns a handle that stops [`AutoAssignScheduler::run`].
    #[must_use]
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Sweeps every tenant on each interval until shutdown is signalled.
    pub async fn run(self) {
        info!(
            interval_secs = self.interval.as_secs(),
            "auto assign scheduler started"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => {
                    info!("auto assign scheduler stopped");
                    break;
                }
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(error) = self.run_tick().await {
                        error!(error = %error, "auto assign tick failed");
                    }
                }
            }
        }
    }

    /// Sweeps every tenant once and returns how many sweeps succeeded.
    pub async fn run_tick(&self) -> AppResult<usize> {
        let mut succeeded = 0;

        for tenant_id in self.tenants.list_tenants().await? {
            match self.service.check_all_targets(tenant_id).await {
                Ok(_) => succeeded += 1,
                Err(error) => {
                    error!(tenant_id = %tenant_id, error = %error, "auto assign sweep failed");
                }
            }
        }

        Ok(succeeded)
    }
}
