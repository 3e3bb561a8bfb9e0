use chrono::{Duration, Utc};
use fleetgate_core::AppError;
use fleetgate_domain::{
    Action, ActionId, ActionStatus, ActionStatusUpdate, ActionType,
    CANCELLATION_FINISHED_MESSAGE, DistributionSetId, Target, TargetType, TargetUpdateStatus,
};

use crate::deployment_ports::{ConfigValue, DeploymentRequest, DeploymentSubmitter};
use crate::tenant_settings::MULTI_ASSIGNMENTS_ENABLED;
use crate::test_support::{Harness, controller, distribution_set};

use super::ActionLifecycleConfig;

fn update(status: ActionStatus) -> ActionStatusUpdate {
    ActionStatusUpdate::new(status, Utc::now())
}

async fn assign(harness: &Harness, controller_id: &str, distribution_set_id: i64) -> Action {
    let controller_id = harness.seed(controller_id, distribution_set_id).await;
    let result = harness
        .action_service()
        .submit(
            harness.tenant_id,
            vec![DeploymentRequest::new(
                controller_id,
                DistributionSetId::new(distribution_set_id),
                ActionType::Forced,
            )],
        )
        .await
        .unwrap_or_else(|_| unreachable!());

    result
        .assigned
        .into_iter()
        .next()
        .unwrap_or_else(|| unreachable!())
}

#[tokio::test]
async fn submit_creates_running_action_and_marks_target_pending() {
    let harness = Harness::new();
    let action = assign(&harness, "dev-1", 7).await;

    assert_eq!(action.status(), ActionStatus::Running);
    assert!(action.is_active());

    let target = harness
        .store
        .target(harness.tenant_id, &controller("dev-1"))
        .await
        .unwrap_or_else(|| unreachable!());
    assert_eq!(target.update_status(), TargetUpdateStatus::Pending);
    assert_eq!(
        target.assigned_distribution_set(),
        Some(DistributionSetId::new(7))
    );
    assert_eq!(harness.publisher.names().await, vec!["action_created"]);
}

#[tokio::test]
async fn submit_skips_requests_already_satisfied() {
    let harness = Harness::new();
    let action = assign(&harness, "dev-1", 7).await;

    let result = harness
        .action_service()
        .submit(
            harness.tenant_id,
            vec![DeploymentRequest::new(
                action.controller_id().clone(),
                DistributionSetId::new(7),
                ActionType::Forced,
            )],
        )
        .await
        .unwrap_or_else(|_| unreachable!());

    assert!(result.assigned.is_empty());
    assert_eq!(result.already_assigned.len(), 1);
    assert_eq!(harness.store.action_count().await, 1);
}

#[tokio::test]
async fn single_assignment_cancels_previous_active_action() {
    let harness = Harness::new();
    let first = assign(&harness, "dev-1", 7).await;
    harness
        .store
        .insert_distribution_set(harness.tenant_id, distribution_set(8, "os"))
        .await;

    let result = harness
        .action_service()
        .submit(
            harness.tenant_id,
            vec![DeploymentRequest::new(
                first.controller_id().clone(),
                DistributionSetId::new(8),
                ActionType::Soft,
            )],
        )
        .await;
    assert!(result.is_ok());

    let actions = harness
        .store
        .actions_for(harness.tenant_id, first.controller_id())
        .await;
    let previous = actions
        .iter()
        .find(|action| action.id() == first.id())
        .unwrap_or_else(|| unreachable!());
    assert_eq!(previous.status(), ActionStatus::Canceling);
    assert!(
        harness
            .publisher
            .names()
            .await
            .contains(&"cancel_requested")
    );
}

#[tokio::test]
async fn multi_assignment_keeps_previous_actions_running() {
    let harness = Harness::new();
    harness
        .configuration
        .set(MULTI_ASSIGNMENTS_ENABLED, ConfigValue::Bool(true))
        .await;
    let first = assign(&harness, "dev-1", 7).await;
    harness
        .store
        .insert_distribution_set(harness.tenant_id, distribution_set(8, "os"))
        .await;

    let result = harness
        .action_service()
        .submit(
            harness.tenant_id,
            vec![DeploymentRequest::new(
                first.controller_id().clone(),
                DistributionSetId::new(8),
                ActionType::Soft,
            )],
        )
        .await;
    assert!(result.is_ok());

    let active = harness
        .store
        .actions_for(harness.tenant_id, first.controller_id())
        .await
        .into_iter()
        .filter(|action| action.status() == ActionStatus::Running)
        .count();
    assert_eq!(active, 2);
}

#[tokio::test]
async fn submit_rejects_incompatible_and_missing_sets() {
    let harness = Harness::new();
    let controller_id = controller("typed-1");
    harness
        .store
        .insert_target(
            harness.tenant_id,
            Target::register(controller_id.clone(), None, None, Utc::now())
                .with_target_type(
                    TargetType::new("gateway", vec!["firmware".to_owned()])
                        .unwrap_or_else(|_| unreachable!()),
                ),
        )
        .await;
    harness
        .store
        .insert_distribution_set(harness.tenant_id, distribution_set(3, "os"))
        .await;

    let incompatible = harness
        .action_service()
        .submit(
            harness.tenant_id,
            vec![DeploymentRequest::new(
                controller_id.clone(),
                DistributionSetId::new(3),
                ActionType::Forced,
            )],
        )
        .await;
    assert!(matches!(incompatible, Err(AppError::Validation(_))));

    let missing = harness
        .action_service()
        .submit(
            harness.tenant_id,
            vec![DeploymentRequest::new(
                controller_id,
                DistributionSetId::new(99),
                ActionType::Forced,
            )],
        )
        .await;
    assert!(matches!(missing, Err(AppError::NotFound(_))));
}

#[tokio::test]
async fn submit_enforces_actions_per_target_quota() {
    let harness = Harness::new();
    let first = assign(&harness, "dev-1", 7).await;
    harness
        .store
        .insert_distribution_set(harness.tenant_id, distribution_set(8, "os"))
        .await;

    let service = harness.action_service().with_config(ActionLifecycleConfig {
        max_actions_per_target: 1,
        ..ActionLifecycleConfig::default()
    });
    let result = service
        .submit(
            harness.tenant_id,
            vec![DeploymentRequest::new(
                first.controller_id().clone(),
                DistributionSetId::new(8),
                ActionType::Forced,
            )],
        )
        .await;

    assert!(matches!(result, Err(AppError::QuotaExceeded(_))));
}

#[tokio::test]
async fn finished_feedback_closes_action_and_syncs_target() {
    let harness = Harness::new();
    let action = assign(&harness, "dev-1", 7).await;
    let service = harness.action_service();

    let finished = service
        .add_status(harness.tenant_id, action.id(), update(ActionStatus::Finished))
        .await
        .unwrap_or_else(|_| unreachable!());

    assert!(!finished.is_active());
    assert_eq!(finished.status(), ActionStatus::Finished);

    let target = harness
        .store
        .target(harness.tenant_id, action.controller_id())
        .await
        .unwrap_or_else(|| unreachable!());
    assert_eq!(target.update_status(), TargetUpdateStatus::InSync);
    assert!(target.request_attributes());

    let names = harness.publisher.names().await;
    assert!(names.contains(&"attributes_requested"));
    assert!(names.contains(&"assignment_completed"));

    let reopened = service
        .add_status(harness.tenant_id, action.id(), update(ActionStatus::Running))
        .await
        .unwrap_or_else(|_| unreachable!());
    assert!(!reopened.is_active());
    assert_eq!(reopened.status(), ActionStatus::Finished);
}

#[tokio::test]
async fn closed_action_feedback_is_dropped_when_configured() {
    let harness = Harness::new();
    let action = assign(&harness, "dev-1", 7).await;
    let service = harness.action_service().with_config(ActionLifecycleConfig {
        reject_status_for_closed_action: true,
        ..ActionLifecycleConfig::default()
    });

    assert!(
        service
            .add_status(harness.tenant_id, action.id(), update(ActionStatus::Error))
            .await
            .is_ok()
    );
    let before = service
        .status_history(harness.tenant_id, action.id())
        .await
        .unwrap_or_default()
        .len();

    assert!(
        service
            .add_status(harness.tenant_id, action.id(), update(ActionStatus::Download))
            .await
            .is_ok()
    );
    let after = service
        .status_history(harness.tenant_id, action.id())
        .await
        .unwrap_or_default()
        .len();

    assert_eq!(before, after);
}

#[tokio::test]
async fn informational_feedback_respects_quotas() {
    let harness = Harness::new();
    let action = assign(&harness, "dev-1", 7).await;
    let service = harness.action_service().with_config(ActionLifecycleConfig {
        max_status_entries_per_action: 2,
        max_messages_per_entry: 1,
        max_message_length: 5,
        ..ActionLifecycleConfig::default()
    });

    let too_many_messages = service
        .add_status(
            harness.tenant_id,
            action.id(),
            update(ActionStatus::Download)
                .with_message("a")
                .with_message("b"),
        )
        .await;
    assert!(matches!(too_many_messages, Err(AppError::QuotaExceeded(_))));

    let too_long = service
        .add_status(
            harness.tenant_id,
            action.id(),
            update(ActionStatus::Download).with_message("too long"),
        )
        .await;
    assert!(matches!(too_long, Err(AppError::QuotaExceeded(_))));

    assert!(
        service
            .add_status(harness.tenant_id, action.id(), update(ActionStatus::Download))
            .await
            .is_ok()
    );
    let over_entries = service
        .add_status(harness.tenant_id, action.id(), update(ActionStatus::Warning))
        .await;
    assert!(matches!(over_entries, Err(AppError::QuotaExceeded(_))));

    let terminal = service
        .add_status(harness.tenant_id, action.id(), update(ActionStatus::Finished))
        .await;
    assert!(terminal.is_ok());
}

#[tokio::test]
async fn cancel_family_is_rejected_on_update_channel() {
    let harness = Harness::new();
    let action = assign(&harness, "dev-1", 7).await;

    let result = harness
        .action_service()
        .add_status(harness.tenant_id, action.id(), update(ActionStatus::Canceled))
        .await;

    assert!(matches!(result, Err(AppError::InvalidState(_))));
}

#[tokio::test]
async fn unknown_action_is_not_found() {
    let harness = Harness::new();

    let result = harness
        .action_service()
        .add_status(
            harness.tenant_id,
            ActionId::new(404),
            update(ActionStatus::Running),
        )
        .await;

    assert!(matches!(result, Err(AppError::NotFound(_))));
}

#[tokio::test]
async fn register_retrieved_records_a_single_entry() {
    let harness = Harness::new();
    let action = assign(&harness, "dev-1", 7).await;
    let service = harness.action_service();

    for _ in 0..2 {
        assert!(
            service
                .register_retrieved(harness.tenant_id, action.id(), Some("fetched".to_owned()))
                .await
                .is_ok()
        );
    }

    let retrieved = service
        .status_history(harness.tenant_id, action.id())
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|entry| entry.status() == ActionStatus::Retrieved)
        .count();
    assert_eq!(retrieved, 1);
}

#[tokio::test]
async fn cancel_reject_then_finish_scenario() {
    let harness = Harness::new();
    let action = assign(&harness, "dev-1", 7).await;
    let service = harness.action_service();
    let tenant_id = harness.tenant_id;

    assert!(service.register_retrieved(tenant_id, action.id(), None).await.is_ok());

    let canceling = service
        .cancel(tenant_id, action.id())
        .await
        .unwrap_or_else(|_| unreachable!());
    assert_eq!(canceling.status(), ActionStatus::Canceling);

    let again = service.cancel(tenant_id, action.id()).await;
    assert!(matches!(again, Err(AppError::CancelNotAllowed(_))));

    let rejected = service
        .add_cancel_status(tenant_id, action.id(), update(ActionStatus::CancelRejected))
        .await
        .unwrap_or_else(|_| unreachable!());
    assert_eq!(rejected.status(), ActionStatus::Running);
    assert!(rejected.is_active());

    let finished = service
        .add_status(tenant_id, action.id(), update(ActionStatus::Finished))
        .await
        .unwrap_or_else(|_| unreachable!());
    assert_eq!(finished.status(), ActionStatus::Finished);
    assert!(!finished.is_active());
}

#[tokio::test]
async fn confirmed_cancel_appends_completion_message_and_falls_back() {
    let harness = Harness::new();
    let action = assign(&harness, "dev-1", 7).await;
    let service = harness.action_service();
    let tenant_id = harness.tenant_id;

    assert!(service.cancel(tenant_id, action.id()).await.is_ok());
    let canceled = service
        .add_cancel_status(tenant_id, action.id(), update(ActionStatus::Canceled))
        .await
        .unwrap_or_else(|_| unreachable!());

    assert_eq!(canceled.status(), ActionStatus::Canceled);
    assert!(!canceled.is_active());

    let history = service
        .status_history(tenant_id, action.id())
        .await
        .unwrap_or_default();
    let last = history.last().unwrap_or_else(|| unreachable!());
    assert!(
        last.messages()
            .iter()
            .any(|message| message == CANCELLATION_FINISHED_MESSAGE)
    );

    let target = harness
        .store
        .target(tenant_id, action.controller_id())
        .await
        .unwrap_or_else(|| unreachable!());
    assert_eq!(target.assigned_distribution_set(), None);
    assert_eq!(target.update_status(), TargetUpdateStatus::Registered);
}

#[tokio::test]
async fn cancel_feedback_without_cancel_request_is_refused() {
    let harness = Harness::new();
    let action = assign(&harness, "dev-1", 7).await;

    let result = harness
        .action_service()
        .add_cancel_status(harness.tenant_id, action.id(), update(ActionStatus::Canceled))
        .await;

    assert!(matches!(result, Err(AppError::CancelNotAllowed(_))));
}

#[tokio::test]
async fn force_quit_closes_canceling_action() {
    let harness = Harness::new();
    let action = assign(&harness, "dev-1", 7).await;
    let service = harness.action_service();

    assert!(
        service
            .force_quit(harness.tenant_id, action.id())
            .await
            .is_err()
    );
    assert!(service.cancel(harness.tenant_id, action.id()).await.is_ok());

    let quit = service
        .force_quit(harness.tenant_id, action.id())
        .await
        .unwrap_or_else(|_| unreachable!());
    assert_eq!(quit.status(), ActionStatus::Canceled);
    assert!(!quit.is_active());
}

#[tokio::test]
async fn conflicting_writes_are_retried() {
    let harness = Harness::new();
    let action = assign(&harness, "dev-1", 7).await;
    harness.store.inject_conflicts(2).await;

    let result = harness
        .action_service()
        .add_status(harness.tenant_id, action.id(), update(ActionStatus::Download))
        .await;

    assert!(matches!(result, Ok(ref action) if action.status() == ActionStatus::Download));
}

#[tokio::test]
async fn exhausted_retries_surface_conflict() {
    let harness = Harness::new();
    let action = assign(&harness, "dev-1", 7).await;
    harness.store.inject_conflicts(5).await;

    let result = harness
        .action_service()
        .add_status(harness.tenant_id, action.id(), update(ActionStatus::Download))
        .await;

    assert!(matches!(result, Err(AppError::ConcurrencyConflict(_))));
}

#[tokio::test]
async fn highest_weight_actions_are_ordered_by_weight_then_age() {
    let harness = Harness::new();
    harness
        .configuration
        .set(MULTI_ASSIGNMENTS_ENABLED, ConfigValue::Bool(true))
        .await;
    let controller_id = harness.seed("dev-1", 1).await;
    for id in [2, 3] {
        harness
            .store
            .insert_distribution_set(harness.tenant_id, distribution_set(id, "os"))
            .await;
    }

    let requests = [(1, Some(10)), (2, None), (3, Some(500))]
        .into_iter()
        .map(|(id, weight)| DeploymentRequest {
            weight,
            ..DeploymentRequest::new(
                controller_id.clone(),
                DistributionSetId::new(id),
                ActionType::Soft,
            )
        })
        .collect();
    let service = harness.action_service();
    assert!(service.submit(harness.tenant_id, requests).await.is_ok());

    let ordered = service
        .find_highest_weight_active_actions(harness.tenant_id, &controller_id, 2)
        .await
        .unwrap_or_default();

    let sets: Vec<i64> = ordered
        .iter()
        .map(|action| action.distribution_set_id().value())
        .collect();
    assert_eq!(sets, vec![2, 3]);
}

#[tokio::test]
async fn force_action_and_external_ref_update_the_action() {
    let harness = Harness::new();
    let controller_id = harness.seed("dev-1", 7).await;
    let service = harness.action_service();
    let result = service
        .submit(
            harness.tenant_id,
            vec![DeploymentRequest::new(
                controller_id,
                DistributionSetId::new(7),
                ActionType::TimeForced {
                    force_at: Utc::now() + Duration::hours(1),
                },
            )],
        )
        .await
        .unwrap_or_else(|_| unreachable!());
    let action_id = result.assigned[0].id();

    let forced = service
        .force_action(harness.tenant_id, action_id)
        .await
        .unwrap_or_else(|_| unreachable!());
    assert_eq!(forced.action_type(), ActionType::Forced);

    let referenced = service
        .update_external_ref(harness.tenant_id, action_id, Some(" ext-42 ".to_owned()))
        .await
        .unwrap_or_else(|_| unreachable!());
    assert_eq!(referenced.external_ref(), Some("ext-42"));
}
