use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use fleetgate_core::TenantId;
use fleetgate_domain::{
    ActionType, AutoAssignment, DistributionSetId, Target, TargetFilterQuery, TargetFilterQueryId,
};

use crate::deployment_ports::LockKey;
use crate::test_support::{Harness, controller, distribution_set};

use super::{AutoAssignConfig, AutoAssignScheduler, SingleTargetCheck};

fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(seconds, 0)
        .single()
        .unwrap_or_else(|| unreachable!())
}

fn auto_query(id: i64, query: &str, distribution_set_id: i64, created_at: i64) -> TargetFilterQuery {
    TargetFilterQuery::new(
        TargetFilterQueryId::new(id),
        format!("query-{id}"),
        query,
        Some(
            AutoAssignment::new(
                DistributionSetId::new(distribution_set_id),
                ActionType::Forced,
                None,
                None,
            )
            .unwrap_or_else(|_| unreachable!()),
        ),
        at(created_at),
    )
    .unwrap_or_else(|_| unreachable!())
}

async fn tagged_target(harness: &Harness, name: &str, tag: &str) {
    let mut target = Target::register(controller(name), None, None, Utc::now());
    target.add_tag(tag);
    harness.store.insert_target(harness.tenant_id, target).await;
}

#[tokio::test]
async fn sweep_assigns_matching_targets_once() {
    let harness = Harness::new();
    harness
        .store
        .insert_distribution_set(harness.tenant_id, distribution_set(5, "os"))
        .await;
    harness
        .store
        .insert_query(harness.tenant_id, auto_query(1, "tag==prod", 5, 10))
        .await;
    for name in ["a", "b", "c"] {
        tagged_target(&harness, name, "prod").await;
    }
    tagged_target(&harness, "lab", "lab").await;

    let service = harness
        .auto_assign_service()
        .with_config(AutoAssignConfig { page_size: 2 });

    let first = service
        .check_all_targets(harness.tenant_id)
        .await
        .unwrap_or_else(|_| unreachable!());
    assert!(first.lock_acquired);
    assert_eq!(first.queries_processed, 1);
    assert_eq!(first.actions_created, 3);

    let rerun = service
        .check_all_targets(harness.tenant_id)
        .await
        .unwrap_or_else(|_| unreachable!());
    assert_eq!(rerun.actions_created, 0);
    assert_eq!(harness.store.action_count().await, 3);

    let actions = harness
        .store
        .actions_for(harness.tenant_id, &controller("a"))
        .await;
    assert_eq!(actions[0].initiated_by(), Some("autoassign:query-1"));
    assert!(
        harness
            .lock
            .released()
            .await
            .contains(&LockKey::auto_assign(harness.tenant_id).as_str().to_owned())
    );
}

#[tokio::test]
async fn sweep_is_skipped_when_lock_is_held_elsewhere() {
    let harness = Harness::new();
    harness
        .store
        .insert_distribution_set(harness.tenant_id, distribution_set(5, "os"))
        .await;
    harness
        .store
        .insert_query(harness.tenant_id, auto_query(1, "tag==prod", 5, 10))
        .await;
    tagged_target(&harness, "a", "prod").await;
    harness
        .lock
        .hold_elsewhere(&LockKey::auto_assign(harness.tenant_id))
        .await;

    let report = harness
        .auto_assign_service()
        .check_all_targets(harness.tenant_id)
        .await
        .unwrap_or_else(|_| unreachable!());

    assert!(!report.lock_acquired);
    assert_eq!(harness.store.action_count().await, 0);
}

#[tokio::test]
async fn failing_query_does_not_stop_the_sweep() {
    let harness = Harness::new();
    harness
        .store
        .insert_distribution_set(harness.tenant_id, distribution_set(5, "os"))
        .await;
    harness
        .store
        .insert_query(harness.tenant_id, auto_query(1, "tag==prod", 404, 10))
        .await;
    harness
        .store
        .insert_query(harness.tenant_id, auto_query(2, "tag==prod", 5, 20))
        .await;
    tagged_target(&harness, "a", "prod").await;

    let report = harness
        .auto_assign_service()
        .check_all_targets(harness.tenant_id)
        .await
        .unwrap_or_else(|_| unreachable!());

    assert_eq!(report.queries_failed, 1);
    assert_eq!(report.queries_processed, 1);
    assert_eq!(report.actions_created, 1);
}

#[tokio::test]
async fn single_target_uses_oldest_matching_query() {
    let harness = Harness::new();
    for id in [5, 6] {
        harness
            .store
            .insert_distribution_set(harness.tenant_id, distribution_set(id, "os"))
            .await;
    }
    harness
        .store
        .insert_query(harness.tenant_id, auto_query(2, "tag==prod", 6, 20))
        .await;
    harness
        .store
        .insert_query(harness.tenant_id, auto_query(1, "tag==prod", 5, 10))
        .await;
    tagged_target(&harness, "a", "prod").await;

    let outcome = harness
        .auto_assign_service()
        .check_single_target(harness.tenant_id, &controller("a"))
        .await
        .unwrap_or_else(|_| unreachable!());

    assert_eq!(
        outcome,
        SingleTargetCheck::Assigned {
            query_id: TargetFilterQueryId::new(1)
        }
    );
    let target = harness
        .store
        .target(harness.tenant_id, &controller("a"))
        .await
        .unwrap_or_else(|| unreachable!());
    assert_eq!(
        target.assigned_distribution_set(),
        Some(DistributionSetId::new(5))
    );
}

#[tokio::test]
async fn single_target_without_match_reports_no_match() {
    let harness = Harness::new();
    harness
        .store
        .insert_distribution_set(harness.tenant_id, distribution_set(5, "os"))
        .await;
    harness
        .store
        .insert_query(harness.tenant_id, auto_query(1, "tag==prod", 5, 10))
        .await;
    tagged_target(&harness, "a", "lab").await;

    let outcome = harness
        .auto_assign_service()
        .check_single_target(harness.tenant_id, &controller("a"))
        .await;

    assert!(matches!(outcome, Ok(SingleTargetCheck::NoMatch)));
}

#[tokio::test]
async fn single_target_defers_when_lock_is_held() {
    let harness = Harness::new();
    tagged_target(&harness, "a", "prod").await;
    harness
        .lock
        .hold_elsewhere(&LockKey::auto_assign(harness.tenant_id))
        .await;

    let outcome = harness
        .auto_assign_service()
        .check_single_target(harness.tenant_id, &controller("a"))
        .await;

    assert!(matches!(outcome, Ok(SingleTargetCheck::Deferred)));
    let target = harness
        .store
        .target(harness.tenant_id, &controller("a"))
        .await
        .unwrap_or_else(|| unreachable!());
    assert!(target.request_attributes());
    assert_eq!(
        harness.publisher.names().await,
        vec!["attributes_requested"]
    );
}

#[tokio::test]
async fn scheduler_tick_sweeps_every_tenant() {
    let harness = Harness::new();
    harness.configuration.add_tenant(harness.tenant_id).await;
    harness
        .configuration
        .add_tenant(TenantId::new())
        .await;

    let scheduler = AutoAssignScheduler::new(
        harness.auto_assign_service(),
        harness.configuration.clone(),
        Duration::from_secs(60),
    );

    let swept = scheduler.run_tick().await;
    assert!(matches!(swept, Ok(2)));

    let shutdown = scheduler.shutdown_handle();
    let handle = tokio::spawn(scheduler.run());
    shutdown.notify_one();
    assert!(handle.await.is_ok());
}
