use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use fleetgate_core::{AppError, AppResult, TenantId};
use fleetgate_domain::{
    ActionStatus, ActionStatusUpdate, ControllerId, NewAction, validate_weight,
};
use tracing::info;

use crate::deployment_ports::{
    AssignmentWrite, DeferredEvents, DeploymentEvent, DeploymentRequest, DeploymentResult,
    DeploymentSubmitter,
};
use crate::retry::retry_on_conflict;

use super::ActionLifecycleService;

const SUPERSEDED_MESSAGE: &str = "Canceled due to a new assignment.";

type RequestGroup = (ControllerId, Vec<DeploymentRequest>);

#[async_trait]
impl DeploymentSubmitter for ActionLifecycleService {
    async fn submit(
        &self,
        tenant_id: TenantId,
        requests: Vec<DeploymentRequest>,
    ) -> AppResult<DeploymentResult> {
        if requests.is_empty() {
            return Ok(DeploymentResult::default());
        }

        let multi_assignments = self.settings.multi_assignments_enabled(tenant_id).await?;
        let groups = group_by_target(requests, multi_assignments)?;

        let (result, events) = retry_on_conflict(self.config.retry, "submit", || {
            self.try_submit(tenant_id, &groups, multi_assignments)
        })
        .await?;

        info!(
            tenant_id = %tenant_id,
            assigned = result.assigned.len(),
            already_assigned = result.already_assigned.len(),
            "submitted deployment batch"
        );
        self.publish(events).await;
        Ok(result)
    }
}

impl ActionLifecycleService {
    async fn try_submit(
        &self,
        tenant_id: TenantId,
        groups: &[RequestGroup],
        multi_assignments: bool,
    ) -> AppResult<(DeploymentResult, DeferredEvents)> {
        let now = Utc::now();
        let mut events = DeferredEvents::new();
        let mut writes = Vec::new();
        let mut already_assigned = Vec::new();

        for (controller_id, requests) in groups {
            let mut target = self.load_target(tenant_id, controller_id).await?;
            let active = self
                .actions
                .list_active_actions(tenant_id, controller_id)
                .await?;

            let mut new_actions = Vec::new();
            for request in requests {
                validate_weight(request.weight)?;

                let distribution_set = self
                    .distribution_sets
                    .find_distribution_set(tenant_id, request.distribution_set_id)
                    .await?
                    .ok_or_else(|| {
                        AppError::NotFound(format!(
                            "distribution set '{}' does not exist",
                            request.distribution_set_id
                        ))
                    })?;

                if !distribution_set.is_assignable() {
                    return Err(AppError::InvalidState(format!(
                        "distribution set '{}' is incomplete or deleted",
                        distribution_set.id()
                    )));
                }

                if !target.is_compatible_with(&distribution_set) {
                    return Err(AppError::Validation(format!(
                        "distribution set type '{}' is not compatible with target '{controller_id}'",
                        distribution_set.type_key()
                    )));
                }

                let satisfied = !multi_assignments
                    && active.iter().any(|action| {
                        action.distribution_set_id() == distribution_set.id()
                            && !action.status().is_canceling_or_canceled()
                    });
                if satisfied {
                    already_assigned.push((controller_id.clone(), distribution_set.id()));
                    continue;
                }

                new_actions.push(NewAction {
                    controller_id: controller_id.clone(),
                    distribution_set_id: distribution_set.id(),
                    action_type: request.action_type,
                    weight: request.weight,
                    maintenance_window: request.maintenance_window.clone(),
                    external_ref: None,
                    initiated_by: request.initiated_by.clone(),
                });
            }

            if new_actions.is_empty() {
                continue;
            }

            let existing = self
                .actions
                .count_actions_for_target(tenant_id, controller_id)
                .await?;
            let requested = new_actions.len() as u64;
            if existing + requested > self.config.max_actions_per_target {
                return Err(AppError::QuotaExceeded(format!(
                    "target '{controller_id}' holds {existing} actions, adding {requested} exceeds limit {}",
                    self.config.max_actions_per_target
                )));
            }

            let mut superseded = Vec::new();
            if !multi_assignments {
                for mut action in active {
                    if action.status().is_canceling_or_canceled() {
                        continue;
                    }
                    action.request_cancel(now)?;
                    events.push(DeploymentEvent::CancelRequested {
                        tenant_id,
                        controller_id: controller_id.clone(),
                        action_id: action.id(),
                    });
                    superseded.push((
                        action,
                        ActionStatusUpdate::new(ActionStatus::Canceling, now)
                            .with_message(SUPERSEDED_MESSAGE),
                    ));
                }
            }

            for new_action in &new_actions {
                target.assign_distribution_set(new_action.distribution_set_id);
            }

            writes.push(AssignmentWrite {
                target,
                new_actions,
                superseded,
                created_at: now,
            });
        }

        if writes.is_empty() {
            return Ok((
                DeploymentResult {
                    assigned: Vec::new(),
                    already_assigned,
                },
                events,
            ));
        }

        let assigned = self.actions.save_assignments(tenant_id, writes).await?;
        for action in &assigned {
            events.push(DeploymentEvent::ActionCreated {
                tenant_id,
                controller_id: action.controller_id().clone(),
                action_id: action.id(),
                distribution_set_id: action.distribution_set_id(),
            });
        }

        Ok((
            DeploymentResult {
                assigned,
                already_assigned,
            },
            events,
        ))
    }
}

/// Groups requests per target in order of first appearance.
///
/// Without multi assignment a target may receive only one distribution set
/// per batch; identical duplicates collapse.
fn group_by_target(
    requests: Vec<DeploymentRequest>,
    multi_assignments: bool,
) -> AppResult<Vec<RequestGroup>> {
    let mut positions: HashMap<ControllerId, usize> = HashMap::new();
    let mut groups: Vec<RequestGroup> = Vec::new();

    for request in requests {
        let Some(&position) = positions.get(&request.controller_id) else {
            positions.insert(request.controller_id.clone(), groups.len());
            groups.push((request.controller_id.clone(), vec![request]));
            continue;
        };

        let (controller_id, group) = &mut groups[position];
        if multi_assignments {
            group.push(request);
            continue;
        }

        if group
            .iter()
            .any(|existing| existing.distribution_set_id != request.distribution_set_id)
        {
            return Err(AppError::Validation(format!(
                "target '{controller_id}' receives several distribution sets but multi assignment is disabled"
            )));
        }
    }

    Ok(groups)
}
