use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetgate_application::{
    ActionRepository, ActionStatusChange, AssignmentWrite, CandidatePageQuery,
    DistributionSetRepository, RolloutRepository, TargetFilterQueryRepository, TargetRepository,
};
use fleetgate_core::{AppError, AppResult, NonEmptyString, TenantId};
use fleetgate_domain::{
    Action, ActionId, ActionParts, ActionStatus, ActionStatusEntry, ActionStatusUpdate,
    ActionType, AutoAssignment, ControllerId, DistributionSet, DistributionSetId,
    MaintenanceWindow, NewAction, Target, TargetFilterQuery, TargetFilterQueryId, TargetParts,
    TargetType, TargetUpdateStatus,
};
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, PgPool, Postgres, Transaction};

mod actions;
mod catalog;
mod targets;

const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const UNIQUE_VIOLATION: &str = "23505";

/// PostgreSQL-backed repository for targets, actions, filter queries,
/// distribution sets and rollouts.
#[derive(Clone)]
pub struct PostgresDeploymentRepository {
    pool: PgPool,
}

impl PostgresDeploymentRepository {
    /// Creates a repository with the provided connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn begin(&self) -> AppResult<Transaction<'static, Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|error| AppError::Internal(format!("failed to begin transaction: {error}")))
    }
}

async fn commit(transaction: Transaction<'static, Postgres>) -> AppResult<()> {
    transaction
        .commit()
        .await
        .map_err(|error| map_database_error("failed to commit transaction", error))
}

/// Maps driver errors to application errors.
///
/// Serialization failures and deadlocks are retryable conflicts; unique
/// violations mean the row already exists.
fn map_database_error(context: &str, error: sqlx::Error) -> AppError {
    if let sqlx::Error::Database(database_error) = &error {
        match database_error.code().as_deref() {
            Some(SERIALIZATION_FAILURE | DEADLOCK_DETECTED) => {
                return AppError::ConcurrencyConflict(format!("{context}: {database_error}"));
            }
            Some(UNIQUE_VIOLATION) => {
                return AppError::AlreadyExists(format!("{context}: {database_error}"));
            }
            _ => {}
        }
    }

    AppError::Internal(format!("{context}: {error}"))
}

const TARGET_SELECT: &str = r#"
    SELECT
        t.controller_id,
        t.name,
        t.description,
        t.address,
        t.update_status,
        t.last_poll_at,
        t.last_installation_at,
        t.attributes,
        t.metadata,
        t.tags,
        t.request_attributes,
        t.assigned_distribution_set_id,
        t.installed_distribution_set_id,
        t.target_type_key,
        tt.compatible_set_types,
        t.created_at,
        t.version
    FROM targets t
    LEFT JOIN target_types tt
        ON tt.tenant_id = t.tenant_id
        AND tt.type_key = t.target_type_key
"#;

const ACTION_SELECT: &str = r#"
    SELECT
        id,
        controller_id,
        distribution_set_id,
        status,
        active,
        weight,
        action_type,
        force_at,
        maintenance_schedule,
        maintenance_duration,
        maintenance_timezone,
        external_ref,
        initiated_by,
        created_at,
        last_modified_at,
        version
    FROM actions
"#;

#[derive(Debug, FromRow)]
struct TargetRow {
    controller_id: String,
    name: String,
    description: Option<String>,
    address: Option<String>,
    update_status: String,
    last_poll_at: Option<DateTime<Utc>>,
    last_installation_at: Option<DateTime<Utc>>,
    attributes: Json<BTreeMap<String, String>>,
    metadata: Json<BTreeMap<String, String>>,
    tags: Vec<String>,
    request_attributes: bool,
    assigned_distribution_set_id: Option<i64>,
    installed_distribution_set_id: Option<i64>,
    target_type_key: Option<String>,
    compatible_set_types: Option<Vec<String>>,
    created_at: DateTime<Utc>,
    version: i64,
}

#[derive(Debug, FromRow)]
struct ActionRow {
    id: i64,
    controller_id: String,
    distribution_set_id: i64,
    status: String,
    active: bool,
    weight: Option<i32>,
    action_type: String,
    force_at: Option<DateTime<Utc>>,
    maintenance_schedule: Option<String>,
    maintenance_duration: Option<String>,
    maintenance_timezone: Option<String>,
    external_ref: Option<String>,
    initiated_by: Option<String>,
    created_at: DateTime<Utc>,
    last_modified_at: DateTime<Utc>,
    version: i64,
}

#[derive(Debug, FromRow)]
struct StatusEntryRow {
    id: i64,
    action_id: i64,
    status: String,
    messages: Vec<String>,
    occurred_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct FilterQueryRow {
    id: i64,
    name: String,
    query: String,
    auto_assign_distribution_set_id: Option<i64>,
    auto_assign_action_type: Option<String>,
    auto_assign_weight: Option<i32>,
    auto_assign_initiated_by: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct DistributionSetRow {
    id: i64,
    name: String,
    version: String,
    type_key: String,
    complete: bool,
    deleted: bool,
}

fn target_from_row(row: TargetRow) -> AppResult<Target> {
    let target_type = match row.target_type_key {
        Some(key) => Some(TargetType::new(
            key,
            row.compatible_set_types.unwrap_or_default(),
        )?),
        None => None,
    };

    Ok(Target::restore(TargetParts {
        controller_id: ControllerId::new(row.controller_id)?,
        name: row.name,
        description: row.description,
        address: row.address,
        update_status: TargetUpdateStatus::parse(row.update_status.as_str())?,
        last_poll_at: row.last_poll_at,
        last_installation_at: row.last_installation_at,
        attributes: row.attributes.0,
        metadata: row.metadata.0,
        tags: row.tags.into_iter().collect::<BTreeSet<_>>(),
        request_attributes: row.request_attributes,
        assigned_distribution_set: row.assigned_distribution_set_id.map(DistributionSetId::new),
        installed_distribution_set: row
            .installed_distribution_set_id
            .map(DistributionSetId::new),
        target_type,
        created_at: row.created_at,
        version: row.version,
    }))
}

fn action_from_row(row: ActionRow) -> AppResult<Action> {
    let maintenance_window = match (
        row.maintenance_schedule,
        row.maintenance_duration,
        row.maintenance_timezone,
    ) {
        (Some(schedule), Some(duration), Some(timezone)) => {
            Some(MaintenanceWindow::new(schedule, duration, timezone)?)
        }
        _ => None,
    };

    Ok(Action::restore(ActionParts {
        id: ActionId::new(row.id),
        controller_id: ControllerId::new(row.controller_id)?,
        distribution_set_id: DistributionSetId::new(row.distribution_set_id),
        status: row.status.parse::<ActionStatus>()?,
        active: row.active,
        weight: row.weight,
        action_type: ActionType::parse(row.action_type.as_str(), row.force_at)?,
        maintenance_window,
        external_ref: row.external_ref,
        initiated_by: row.initiated_by,
        created_at: row.created_at,
        last_modified_at: row.last_modified_at,
        version: row.version,
    }))
}

fn status_entry_from_row(row: StatusEntryRow) -> AppResult<ActionStatusEntry> {
    let mut update = ActionStatusUpdate::new(row.status.parse::<ActionStatus>()?, row.occurred_at);
    update.messages = row.messages;

    Ok(ActionStatusEntry::new(
        row.id,
        ActionId::new(row.action_id),
        update,
    ))
}

fn filter_query_from_row(row: FilterQueryRow) -> AppResult<TargetFilterQuery> {
    let auto_assignment = match (row.auto_assign_distribution_set_id, row.auto_assign_action_type)
    {
        (Some(distribution_set_id), Some(action_type)) => Some(AutoAssignment::new(
            DistributionSetId::new(distribution_set_id),
            ActionType::parse(action_type.as_str(), None)?,
            row.auto_assign_weight,
            row.auto_assign_initiated_by,
        )?),
        _ => None,
    };

    Ok(TargetFilterQuery::restore(
        TargetFilterQueryId::new(row.id),
        NonEmptyString::new(row.name)?,
        row.query,
        auto_assignment,
        row.created_at,
    ))
}

fn distribution_set_from_row(row: DistributionSetRow) -> AppResult<DistributionSet> {
    DistributionSet::new(
        DistributionSetId::new(row.id),
        row.name,
        row.version,
        row.type_key,
        row.complete,
        row.deleted,
    )
}

#[async_trait]
impl TargetRepository for PostgresDeploymentRepository {
    async fn find_target(
        &self,
        tenant_id: TenantId,
        controller_id: &ControllerId,
    ) -> AppResult<Option<Target>> {
        self.find_target_impl(tenant_id, controller_id).await
    }

    async fn create_target(&self, tenant_id: TenantId, target: Target) -> AppResult<Target> {
        self.create_target_impl(tenant_id, target).await
    }

    async fn update_target(&self, tenant_id: TenantId, target: Target) -> AppResult<Target> {
        let mut transaction = self.begin().await?;
        let saved = targets::update_target_in(&mut transaction, tenant_id, target).await?;
        commit(transaction).await?;
        Ok(saved)
    }

    async fn touch_last_poll(
        &self,
        tenant_id: TenantId,
        controller_ids: &[ControllerId],
        polled_at: DateTime<Utc>,
    ) -> AppResult<u64> {
        self.touch_last_poll_impl(tenant_id, controller_ids, polled_at)
            .await
    }

    async fn mark_request_attributes(
        &self,
        tenant_id: TenantId,
        controller_id: &ControllerId,
    ) -> AppResult<()> {
        self.mark_request_attributes_impl(tenant_id, controller_id)
            .await
    }

    async fn list_auto_assign_candidates(
        &self,
        tenant_id: TenantId,
        query: CandidatePageQuery,
    ) -> AppResult<Vec<Target>> {
        self.list_auto_assign_candidates_impl(tenant_id, query)
            .await
    }
}

#[async_trait]
impl ActionRepository for PostgresDeploymentRepository {
    async fn find_action(
        &self,
        tenant_id: TenantId,
        action_id: ActionId,
    ) -> AppResult<Option<Action>> {
        self.find_action_impl(tenant_id, action_id).await
    }

    async fn latest_status(
        &self,
        tenant_id: TenantId,
        action_id: ActionId,
    ) -> AppResult<Option<ActionStatusEntry>> {
        self.latest_status_impl(tenant_id, action_id).await
    }

    async fn count_status_entries(
        &self,
        tenant_id: TenantId,
        action_id: ActionId,
    ) -> AppResult<u64> {
        self.count_status_entries_impl(tenant_id, action_id).await
    }

    async fn list_status_entries(
        &self,
        tenant_id: TenantId,
        action_id: ActionId,
    ) -> AppResult<Vec<ActionStatusEntry>> {
        self.list_status_entries_impl(tenant_id, action_id).await
    }

    async fn list_active_actions(
        &self,
        tenant_id: TenantId,
        controller_id: &ControllerId,
    ) -> AppResult<Vec<Action>> {
        self.list_active_actions_impl(tenant_id, controller_id)
            .await
    }

    async fn count_actions_for_target(
        &self,
        tenant_id: TenantId,
        controller_id: &ControllerId,
    ) -> AppResult<u64> {
        self.count_actions_for_target_impl(tenant_id, controller_id)
            .await
    }

    async fn has_action_for_distribution_set(
        &self,
        tenant_id: TenantId,
        controller_id: &ControllerId,
        distribution_set_id: DistributionSetId,
    ) -> AppResult<bool> {
        self.has_action_for_distribution_set_impl(tenant_id, controller_id, distribution_set_id)
            .await
    }

    async fn save_status_change(
        &self,
        tenant_id: TenantId,
        change: ActionStatusChange,
    ) -> AppResult<Action> {
        self.save_status_change_impl(tenant_id, change).await
    }

    async fn save_assignments(
        &self,
        tenant_id: TenantId,
        writes: Vec<AssignmentWrite>,
    ) -> AppResult<Vec<Action>> {
        self.save_assignments_impl(tenant_id, writes).await
    }

    async fn delete_inactive_actions(
        &self,
        tenant_id: TenantId,
        statuses: &[ActionStatus],
        modified_before: DateTime<Utc>,
        limit: usize,
    ) -> AppResult<u64> {
        self.delete_inactive_actions_impl(tenant_id, statuses, modified_before, limit)
            .await
    }
}

#[async_trait]
impl TargetFilterQueryRepository for PostgresDeploymentRepository {
    async fn list_auto_assign_queries(
        &self,
        tenant_id: TenantId,
    ) -> AppResult<Vec<TargetFilterQuery>> {
        self.list_auto_assign_queries_impl(tenant_id).await
    }

    async fn find_filter_query(
        &self,
        tenant_id: TenantId,
        query_id: TargetFilterQueryId,
    ) -> AppResult<Option<TargetFilterQuery>> {
        self.find_filter_query_impl(tenant_id, query_id).await
    }

    async fn save_filter_query(
        &self,
        tenant_id: TenantId,
        query: TargetFilterQuery,
    ) -> AppResult<()> {
        self.save_filter_query_impl(tenant_id, query).await
    }
}

#[async_trait]
impl DistributionSetRepository for PostgresDeploymentRepository {
    async fn find_distribution_set(
        &self,
        tenant_id: TenantId,
        distribution_set_id: DistributionSetId,
    ) -> AppResult<Option<DistributionSet>> {
        self.find_distribution_set_impl(tenant_id, distribution_set_id)
            .await
    }

    async fn save_distribution_set(
        &self,
        tenant_id: TenantId,
        distribution_set: DistributionSet,
    ) -> AppResult<()> {
        self.save_distribution_set_impl(tenant_id, distribution_set)
            .await
    }
}

#[async_trait]
impl RolloutRepository for PostgresDeploymentRepository {
    async fn delete_soft_deleted_rollouts(
        &self,
        tenant_id: TenantId,
        limit: usize,
    ) -> AppResult<u64> {
        self.delete_soft_deleted_rollouts_impl(tenant_id, limit)
            .await
    }
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}
