use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use fleetgate_core::{AppError, AppResult, TenantId};
use fleetgate_domain::{AttributeLimits, AttributeUpdateMode, ControllerId, Target};
use tracing::{debug, warn};

use crate::auto_assign_service::AutoAssignService;
use crate::deployment_ports::{DeferredEvents, DeploymentEvent, EventPublisher, TargetRepository};
use crate::poll_buffer::PollBuffer;
use crate::retry::{RetryPolicy, retry_on_conflict};
use crate::tenant_settings::TenantSettings;

/// Controller-facing entry points for polls and attribute pushes.
#[derive(Clone)]
pub struct ControllerService {
    targets: Arc<dyn TargetRepository>,
    poll_buffer: PollBuffer,
    publisher: Arc<dyn EventPublisher>,
    settings: TenantSettings,
    auto_assign: Option<AutoAssignService>,
    attribute_limits: AttributeLimits,
    retry: RetryPolicy,
}

impl ControllerService {
    /// Creates a controller service.
    #[must_use]
    pub fn new(
        targets: Arc<dyn TargetRepository>,
        poll_buffer: PollBuffer,
        publisher: Arc<dyn EventPublisher>,
        settings: TenantSettings,
    ) -> Self {
        Self {
            targets,
            poll_buffer,
            publisher,
            settings,
            auto_assign: None,
            attribute_limits: AttributeLimits::default(),
            retry: RetryPolicy::default(),
        }
    }

    /// Enables single-target auto assignment after polls and attribute changes.
    #[must_use]
    pub fn with_auto_assign(mut self, auto_assign: AutoAssignService) -> Self {
        self.auto_assign = Some(auto_assign);
        self
    }

    /// Overrides controller attribute limits.
    #[must_use]
    pub fn with_attribute_limits(mut self, attribute_limits: AttributeLimits) -> Self {
        self.attribute_limits = attribute_limits;
        self
    }

    /// Overrides retry settings for versioned writes.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Handles one controller poll, registering the target on first contact.
    pub async fn find_or_register_target(
        &self,
        tenant_id: TenantId,
        controller_id: ControllerId,
        address: Option<String>,
        name: Option<String>,
    ) -> AppResult<Target> {
        let target = match self.targets.find_target(tenant_id, &controller_id).await? {
            None => {
                match self
                    .register(tenant_id, controller_id.clone(), address.clone(), name.clone())
                    .await
                {
                    Err(AppError::AlreadyExists(_)) => {
                        debug!(
                            tenant_id = %tenant_id,
                            controller_id = %controller_id,
                            "concurrent registration detected; updating instead"
                        );
                        self.record_existing_poll(tenant_id, &controller_id, address, name)
                            .await?
                    }
                    result => result?,
                }
            }
            Some(existing) => {
                if existing.poll_has_material_change(address.as_deref(), name.as_deref())
                    || !self
                        .poll_buffer
                        .try_record_poll(tenant_id, controller_id.clone())
                {
                    self.record_existing_poll(tenant_id, &controller_id, address, name)
                        .await?
                } else {
                    existing
                }
            }
        };

        self.trigger_auto_assign(tenant_id, &controller_id).await;
        Ok(target)
    }

    /// Applies attributes pushed by a controller.
    pub async fn update_controller_attributes(
        &self,
        tenant_id: TenantId,
        controller_id: ControllerId,
        attributes: BTreeMap<String, String>,
        mode: AttributeUpdateMode,
    ) -> AppResult<Target> {
        let (target, changed) =
            retry_on_conflict(self.retry, "update_controller_attributes", || {
                self.try_update_attributes(tenant_id, &controller_id, attributes.clone(), mode)
            })
            .await?;

        if changed {
            self.trigger_auto_assign(tenant_id, &controller_id).await;
        }

        Ok(target)
    }

    async fn try_update_attributes(
        &self,
        tenant_id: TenantId,
        controller_id: &ControllerId,
        attributes: BTreeMap<String, String>,
        mode: AttributeUpdateMode,
    ) -> AppResult<(Target, bool)> {
        let mut target = self.load_target(tenant_id, controller_id).await?;
        let flag_was_set = target.request_attributes();

        let changed = target.apply_attributes(attributes, mode, self.attribute_limits)?;
        if !changed && !flag_was_set {
            return Ok((target, false));
        }

        let saved = self.targets.update_target(tenant_id, target).await?;
        Ok((saved, changed))
    }

    async fn register(
        &self,
        tenant_id: TenantId,
        controller_id: ControllerId,
        address: Option<String>,
        name: Option<String>,
    ) -> AppResult<Target> {
        let target = Target::register(controller_id, address, name, Utc::now());
        let created = self.targets.create_target(tenant_id, target).await?;

        self.publish_poll(tenant_id, &created).await;
        Ok(created)
    }

    async fn record_existing_poll(
        &self,
        tenant_id: TenantId,
        controller_id: &ControllerId,
        address: Option<String>,
        name: Option<String>,
    ) -> AppResult<Target> {
        let saved = retry_on_conflict(self.retry, "record_poll", || {
            let address = address.clone();
            let name = name.clone();
            async move {
                let mut target = self.load_target(tenant_id, controller_id).await?;
                target.apply_poll(address.as_deref(), name.as_deref(), Utc::now());
                self.targets.update_target(tenant_id, target).await
            }
        })
        .await?;

        self.publish_poll(tenant_id, &saved).await;
        Ok(saved)
    }

    async fn load_target(
        &self,
        tenant_id: TenantId,
        controller_id: &ControllerId,
    ) -> AppResult<Target> {
        self.targets
            .find_target(tenant_id, controller_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("target '{controller_id}' does not exist")))
    }

    async fn publish_poll(&self, tenant_id: TenantId, target: &Target) {
        let Some(polled_at) = target.last_poll_at() else {
            return;
        };

        let mut events = DeferredEvents::new();
        events.push(DeploymentEvent::PollObserved {
            tenant_id,
            controller_id: target.controller_id().clone(),
            polled_at,
        });
        events.publish_all(self.publisher.as_ref()).await;
    }

    async fn trigger_auto_assign(&self, tenant_id: TenantId, controller_id: &ControllerId) {
        let Some(auto_assign) = &self.auto_assign else {
            return;
        };

        match self.settings.auto_assign_on_poll_enabled(tenant_id).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(error) => {
                warn!(tenant_id = %tenant_id, error = %error, "failed to read auto assign setting");
                return;
            }
        }

        if let Err(error) = auto_assign
            .check_single_target(tenant_id, controller_id)
            .await
        {
            warn!(
                tenant_id = %tenant_id,
                controller_id = %controller_id,
                error = %error,
                "single target auto assignment failed"
            );
        }
    }
}
