use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetgate_core::{AppResult, TenantId};
use fleetgate_domain::{
    Action, ActionId, ActionStatus, ActionStatusEntry, ActionStatusUpdate, ControllerId,
    DistributionSet, DistributionSetId, NewAction, Target, TargetFilterQuery, TargetFilterQueryId,
};

/// Keyset page request for auto-assign candidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidatePageQuery {
    /// Distribution set the candidates must not already hold.
    pub distribution_set_id: DistributionSetId,
    /// Exclusive controller id lower bound.
    pub after: Option<ControllerId>,
    /// Maximum page size.
    pub limit: usize,
}

/// One atomic action status write.
#[derive(Debug, Clone)]
pub struct ActionStatusChange {
    /// Updated action carrying the version it was loaded with.
    pub action: Action,
    /// History entry appended in the same write.
    pub entry: Option<ActionStatusUpdate>,
    /// Updated target carrying the version it was loaded with.
    pub target: Option<Target>,
}

/// Assignment write for one target inside a submission batch.
#[derive(Debug, Clone)]
pub struct AssignmentWrite {
    /// Updated target carrying the version it was loaded with.
    pub target: Target,
    /// Actions to create.
    pub new_actions: Vec<NewAction>,
    /// Previously active actions moved to canceling, with their history entries.
    pub superseded: Vec<(Action, ActionStatusUpdate)>,
    /// Creation timestamp for new actions.
    pub created_at: DateTime<Utc>,
}

/// Repository port for targets.
#[async_trait]
pub trait TargetRepository: Send + Sync {
    /// Returns one target by controller id.
    async fn find_target(
        &self,
        tenant_id: TenantId,
        controller_id: &ControllerId,
    ) -> AppResult<Option<Target>>;

    /// Creates a target and fails with `AlreadyExists` on a duplicate controller id.
    async fn create_target(&self, tenant_id: TenantId, target: Target) -> AppResult<Target>;

    /// Writes a target when its version still matches and returns the new version.
    async fn update_target(&self, tenant_id: TenantId, target: Target) -> AppResult<Target>;

    /// Updates only the last poll timestamp of the given targets.
    ///
    /// This write bypasses the version counter.
    async fn touch_last_poll(
        &self,
        tenant_id: TenantId,
        controller_ids: &[ControllerId],
        polled_at: DateTime<Utc>,
    ) -> AppResult<u64>;

    /// Sets the request-attributes flag without a version check.
    async fn mark_request_attributes(
        &self,
        tenant_id: TenantId,
        controller_id: &ControllerId,
    ) -> AppResult<()>;

    /// Returns targets ordered by controller id that are neither assigned the
    /// distribution set nor hold any action for it.
    async fn list_auto_assign_candidates(
        &self,
        tenant_id: TenantId,
        query: CandidatePageQuery,
    ) -> AppResult<Vec<Target>>;
}

/// Repository port for actions and their status history.
#[async_trait]
pub trait ActionRepository: Send + Sync {
    /// Returns one action.
    async fn find_action(&self, tenant_id: TenantId, action_id: ActionId)
    -> AppResult<Option<Action>>;

    /// Returns the newest history entry of an action.
    async fn latest_status(
        &self,
        tenant_id: TenantId,
        action_id: ActionId,
    ) -> AppResult<Option<ActionStatusEntry>>;

    /// Counts history entries of an action.
    async fn count_status_entries(&self, tenant_id: TenantId, action_id: ActionId)
    -> AppResult<u64>;

    /// Lists history entries of an action, oldest first.
    async fn list_status_entries(
        &self,
        tenant_id: TenantId,
        action_id: ActionId,
    ) -> AppResult<Vec<ActionStatusEntry>>;

    /// Lists active actions of a target.
    async fn list_active_actions(
        &self,
        tenant_id: TenantId,
        controller_id: &ControllerId,
    ) -> AppResult<Vec<Action>>;

    /// Counts every action of a target.
    async fn count_actions_for_target(
        &self,
        tenant_id: TenantId,
        controller_id: &ControllerId,
    ) -> AppResult<u64>;

    /// Returns whether the target holds any action for the distribution set.
    async fn has_action_for_distribution_set(
        &self,
        tenant_id: TenantId,
        controller_id: &ControllerId,
        distribution_set_id: DistributionSetId,
    ) -> AppResult<bool>;

    /// Writes an action, its history entry and its target atomically.
    ///
    /// Fails with `ConcurrencyConflict` when any version changed since load.
    async fn save_status_change(
        &self,
        tenant_id: TenantId,
        change: ActionStatusChange,
    ) -> AppResult<Action>;

    /// Writes a whole submission batch atomically and returns created actions.
    async fn save_assignments(
        &self,
        tenant_id: TenantId,
        writes: Vec<AssignmentWrite>,
    ) -> AppResult<Vec<Action>>;

    /// Deletes up to `limit` inactive actions with their history.
    async fn delete_inactive_actions(
        &self,
        tenant_id: TenantId,
        statuses: &[ActionStatus],
        modified_before: DateTime<Utc>,
        limit: usize,
    ) -> AppResult<u64>;
}

/// Repository port for saved filter queries.
#[async_trait]
pub trait TargetFilterQueryRepository: Send + Sync {
    /// Lists queries with auto assignment, ordered by creation time then id.
    async fn list_auto_assign_queries(&self, tenant_id: TenantId)
    -> AppResult<Vec<TargetFilterQuery>>;

    /// Returns one query.
    async fn find_filter_query(
        &self,
        tenant_id: TenantId,
        query_id: TargetFilterQueryId,
    ) -> AppResult<Option<TargetFilterQuery>>;

    /// Creates or replaces one query.
    async fn save_filter_query(&self, tenant_id: TenantId, query: TargetFilterQuery)
    -> AppResult<()>;
}

/// Repository port for distribution set references.
#[async_trait]
pub trait DistributionSetRepository: Send + Sync {
    /// Returns one distribution set.
    async fn find_distribution_set(
        &self,
        tenant_id: TenantId,
        distribution_set_id: DistributionSetId,
    ) -> AppResult<Option<DistributionSet>>;

    /// Creates or replaces one distribution set.
    async fn save_distribution_set(
        &self,
        tenant_id: TenantId,
        distribution_set: DistributionSet,
    ) -> AppResult<()>;
}

/// Repository port for rollout housekeeping.
#[async_trait]
pub trait RolloutRepository: Send + Sync {
    /// Deletes up to `limit` soft-deleted rollouts whose actions are gone.
    async fn delete_soft_deleted_rollouts(&self, tenant_id: TenantId, limit: usize)
    -> AppResult<u64>;
}
