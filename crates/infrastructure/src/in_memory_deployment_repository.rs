use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetgate_application::{
    ActionRepository, ActionStatusChange, AssignmentWrite, CandidatePageQuery,
    DistributionSetRepository, RolloutRepository, TargetFilterQueryRepository, TargetRepository,
};
use fleetgate_core::{AppError, AppResult, TenantId};
use fleetgate_domain::{
    Action, ActionId, ActionStatus, ActionStatusEntry, ActionStatusUpdate, ControllerId,
    DistributionSet, DistributionSetId, Target, TargetFilterQuery, TargetFilterQueryId,
};
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct DeploymentState {
    targets: BTreeMap<(TenantId, ControllerId), Target>,
    actions: BTreeMap<ActionId, (TenantId, Action)>,
    status_entries: BTreeMap<ActionId, Vec<ActionStatusEntry>>,
    filter_queries: HashMap<(TenantId, TargetFilterQueryId), TargetFilterQuery>,
    distribution_sets: HashMap<(TenantId, DistributionSetId), DistributionSet>,
    deleted_rollouts: HashMap<TenantId, BTreeSet<i64>>,
    last_action_id: i64,
    last_entry_id: i64,
}

impl DeploymentState {
    fn stored_target(&self, tenant_id: TenantId, target: &Target) -> AppResult<&Target> {
        let stored = self
            .targets
            .get(&(tenant_id, target.controller_id().clone()))
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "target '{}' does not exist for tenant '{tenant_id}'",
                    target.controller_id()
                ))
            })?;

        if stored.version() != target.version() {
            return Err(AppError::ConcurrencyConflict(format!(
                "target '{}' was modified concurrently",
                target.controller_id()
            )));
        }

        Ok(stored)
    }

    fn stored_action(&self, tenant_id: TenantId, action: &Action) -> AppResult<&Action> {
        let stored = self
            .actions
            .get(&action.id())
            .filter(|(stored_tenant_id, _)| *stored_tenant_id == tenant_id)
            .map(|(_, stored)| stored)
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "action '{}' does not exist for tenant '{tenant_id}'",
                    action.id()
                ))
            })?;

        if stored.version() != action.version() {
            return Err(AppError::ConcurrencyConflict(format!(
                "action '{}' was modified concurrently",
                action.id()
            )));
        }

        Ok(stored)
    }

    fn put_target(&mut self, tenant_id: TenantId, mut target: Target) -> Target {
        if let Some(stored) = self
            .targets
            .get(&(tenant_id, target.controller_id().clone()))
        {
            target.merge_stored_signals(stored.last_poll_at(), stored.request_attributes());
        }
        target.set_version(target.version() + 1);
        self.targets
            .insert((tenant_id, target.controller_id().clone()), target.clone());
        target
    }

    fn put_action(&mut self, tenant_id: TenantId, mut action: Action) -> Action {
        action.set_version(action.version() + 1);
        self.actions
            .insert(action.id(), (tenant_id, action.clone()));
        action
    }

    fn push_entry(&mut self, action_id: ActionId, update: ActionStatusUpdate) {
        self.last_entry_id += 1;
        let entry = ActionStatusEntry::new(self.last_entry_id, action_id, update);
        self.status_entries.entry(action_id).or_default().push(entry);
    }

    fn tenant_actions<'a>(
        &'a self,
        tenant_id: TenantId,
        controller_id: &'a ControllerId,
    ) -> impl Iterator<Item = &'a Action> + 'a {
        self.actions
            .values()
            .filter(move |(stored_tenant_id, action)| {
                *stored_tenant_id == tenant_id && action.controller_id() == controller_id
            })
            .map(|(_, action)| action)
    }
}

/// In-memory deployment repository for tests and single-node setups.
///
/// One lock guards all collections so multi-row writes stay atomic.
#[derive(Debug, Default)]
pub struct InMemoryDeploymentRepository {
    state: RwLock<DeploymentState>,
}

impl InMemoryDeploymentRepository {
    /// Creates an empty in-memory repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a rollout as soft deleted so the rollout cleanup task can purge it.
    pub async fn soft_delete_rollout(&self, tenant_id: TenantId, rollout_id: i64) {
        self.state
            .write()
            .await
            .deleted_rollouts
            .entry(tenant_id)
            .or_default()
            .insert(rollout_id);
    }

    /// Counts soft-deleted rollouts still stored for the tenant.
    pub async fn soft_deleted_rollout_count(&self, tenant_id: TenantId) -> usize {
        self.state
            .read()
            .await
            .deleted_rollouts
            .get(&tenant_id)
            .map_or(0, BTreeSet::len)
    }
}

#[async_trait]
impl TargetRepository for InMemoryDeploymentRepository {
    async fn find_target(
        &self,
        tenant_id: TenantId,
        controller_id: &ControllerId,
    ) -> AppResult<Option<Target>> {
        Ok(self
            .state
            .read()
            .await
            .targets
            .get(&(tenant_id, controller_id.clone()))
            .cloned())
    }

    async fn create_target(&self, tenant_id: TenantId, target: Target) -> AppResult<Target> {
        let mut state = self.state.write().await;
        if state
            .targets
            .contains_key(&(tenant_id, target.controller_id().clone()))
        {
            return Err(AppError::AlreadyExists(format!(
                "target '{}' already exists for tenant '{tenant_id}'",
                target.controller_id()
            )));
        }

        Ok(state.put_target(tenant_id, target))
    }

    async fn update_target(&self, tenant_id: TenantId, target: Target) -> AppResult<Target> {
        let mut state = self.state.write().await;
        state.stored_target(tenant_id, &target)?;
        Ok(state.put_target(tenant_id, target))
    }

    async fn touch_last_poll(
        &self,
        tenant_id: TenantId,
        controller_ids: &[ControllerId],
        polled_at: DateTime<Utc>,
    ) -> AppResult<u64> {
        let mut state = self.state.write().await;
        let mut updated = 0;

        for controller_id in controller_ids {
            if let Some(target) = state.targets.get_mut(&(tenant_id, controller_id.clone())) {
                target.touch_poll(polled_at);
                updated += 1;
            }
        }

        Ok(updated)
    }

    async fn mark_request_attributes(
        &self,
        tenant_id: TenantId,
        controller_id: &ControllerId,
    ) -> AppResult<()> {
        let mut state = self.state.write().await;
        let target = state
            .targets
            .get_mut(&(tenant_id, controller_id.clone()))
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "target '{controller_id}' does not exist for tenant '{tenant_id}'"
                ))
            })?;

        target.mark_request_attributes();
        Ok(())
    }

    async fn list_auto_assign_candidates(
        &self,
        tenant_id: TenantId,
        query: CandidatePageQuery,
    ) -> AppResult<Vec<Target>> {
        let state = self.state.read().await;
        let holders: BTreeSet<&ControllerId> = state
            .actions
            .values()
            .filter(|(stored_tenant_id, action)| {
                *stored_tenant_id == tenant_id
                    && action.distribution_set_id() == query.distribution_set_id
            })
            .map(|(_, action)| action.controller_id())
            .collect();

        Ok(state
            .targets
            .iter()
            .filter(|((stored_tenant_id, controller_id), target)| {
                *stored_tenant_id == tenant_id
                    && query
                        .after
                        .as_ref()
                        .is_none_or(|after| controller_id > after)
                    && target.assigned_distribution_set() != Some(query.distribution_set_id)
                    && !holders.contains(controller_id)
            })
            .take(query.limit)
            .map(|(_, target)| target.clone())
            .collect())
    }
}

#[async_trait]
impl ActionRepository for InMemoryDeploymentRepository {
    async fn find_action(
        &self,
        tenant_id: TenantId,
        action_id: ActionId,
    ) -> AppResult<Option<Action>> {
        Ok(self
            .state
            .read()
            .await
            .actions
            .get(&action_id)
            .filter(|(stored_tenant_id, _)| *stored_tenant_id == tenant_id)
            .map(|(_, action)| action.clone()))
    }

    async fn latest_status(
        &self,
        tenant_id: TenantId,
        action_id: ActionId,
    ) -> AppResult<Option<ActionStatusEntry>> {
        Ok(self
            .list_status_entries(tenant_id, action_id)
            .await?
            .pop())
    }

    async fn count_status_entries(
        &self,
        tenant_id: TenantId,
        action_id: ActionId,
    ) -> AppResult<u64> {
        Ok(self.list_status_entries(tenant_id, action_id).await?.len() as u64)
    }

    async fn list_status_entries(
        &self,
        tenant_id: TenantId,
        action_id: ActionId,
    ) -> AppResult<Vec<ActionStatusEntry>> {
        let state = self.state.read().await;
        let owned = state
            .actions
            .get(&action_id)
            .is_some_and(|(stored_tenant_id, _)| *stored_tenant_id == tenant_id);
        if !owned {
            return Ok(Vec::new());
        }

        Ok(state
            .status_entries
            .get(&action_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_active_actions(
        &self,
        tenant_id: TenantId,
        controller_id: &ControllerId,
    ) -> AppResult<Vec<Action>> {
        Ok(self
            .state
            .read()
            .await
            .tenant_actions(tenant_id, controller_id)
            .filter(|action| action.is_active())
            .cloned()
            .collect())
    }

    async fn count_actions_for_target(
        &self,
        tenant_id: TenantId,
        controller_id: &ControllerId,
    ) -> AppResult<u64> {
        Ok(self
            .state
            .read()
            .await
            .tenant_actions(tenant_id, controller_id)
            .count() as u64)
    }

    async fn has_action_for_distribution_set(
        &self,
        tenant_id: TenantId,
        controller_id: &ControllerId,
        distribution_set_id: DistributionSetId,
    ) -> AppResult<bool> {
        Ok(self
            .state
            .read()
            .await
            .tenant_actions(tenant_id, controller_id)
            .any(|action| action.distribution_set_id() == distribution_set_id))
    }

    async fn save_status_change(
        &self,
        tenant_id: TenantId,
        change: ActionStatusChange,
    ) -> AppResult<Action> {
        let mut state = self.state.write().await;
        state.stored_action(tenant_id, &change.action)?;
        if let Some(target) = &change.target {
            state.stored_target(tenant_id, target)?;
        }

        if let Some(update) = change.entry {
            state.push_entry(change.action.id(), update);
        }
        if let Some(target) = change.target {
            state.put_target(tenant_id, target);
        }

        Ok(state.put_action(tenant_id, change.action))
    }

    async fn save_assignments(
        &self,
        tenant_id: TenantId,
        writes: Vec<AssignmentWrite>,
    ) -> AppResult<Vec<Action>> {
        let mut state = self.state.write().await;
        for write in &writes {
            state.stored_target(tenant_id, &write.target)?;
            for (action, _) in &write.superseded {
                state.stored_action(tenant_id, action)?;
            }
        }

        let mut created = Vec::new();
        for write in writes {
            state.put_target(tenant_id, write.target);

            for (action, update) in write.superseded {
                state.push_entry(action.id(), update);
                state.put_action(tenant_id, action);
            }

            for new_action in write.new_actions {
                let action_id = ActionId::new(state.last_action_id + 1);
                let action = Action::create(action_id, new_action, write.created_at)?;
                state.last_action_id = action_id.value();
                state.push_entry(
                    action_id,
                    ActionStatusUpdate::new(ActionStatus::Running, write.created_at),
                );
                created.push(state.put_action(tenant_id, action));
            }
        }

        Ok(created)
    }

    async fn delete_inactive_actions(
        &self,
        tenant_id: TenantId,
        statuses: &[ActionStatus],
        modified_before: DateTime<Utc>,
        limit: usize,
    ) -> AppResult<u64> {
        let mut state = self.state.write().await;
        let expired: Vec<ActionId> = state
            .actions
            .iter()
            .filter(|(_, (stored_tenant_id, action))| {
                *stored_tenant_id == tenant_id
                    && !action.is_active()
                    && statuses.contains(&action.status())
                    && action.last_modified_at() < modified_before
            })
            .map(|(action_id, _)| *action_id)
            .take(limit)
            .collect();

        for action_id in &expired {
            state.actions.remove(action_id);
            state.status_entries.remove(action_id);
        }

        Ok(expired.len() as u64)
    }
}

#[async_trait]
impl TargetFilterQueryRepository for InMemoryDeploymentRepository {
    async fn list_auto_assign_queries(
        &self,
        tenant_id: TenantId,
    ) -> AppResult<Vec<TargetFilterQuery>> {
        let state = self.state.read().await;
        let mut queries: Vec<TargetFilterQuery> = state
            .filter_queries
            .iter()
            .filter_map(|((stored_tenant_id, _), query)| {
                (*stored_tenant_id == tenant_id && query.auto_assignment().is_some())
                    .then(|| query.clone())
            })
            .collect();
        queries.sort_by_key(|query| (query.created_at(), query.id()));

        Ok(queries)
    }

    async fn find_filter_query(
        &self,
        tenant_id: TenantId,
        query_id: TargetFilterQueryId,
    ) -> AppResult<Option<TargetFilterQuery>> {
        Ok(self
            .state
            .read()
            .await
            .filter_queries
            .get(&(tenant_id, query_id))
            .cloned())
    }

    async fn save_filter_query(
        &self,
        tenant_id: TenantId,
        query: TargetFilterQuery,
    ) -> AppResult<()> {
        self.state
            .write()
            .await
            .filter_queries
            .insert((tenant_id, query.id()), query);
        Ok(())
    }
}

#[async_trait]
impl DistributionSetRepository for InMemoryDeploymentRepository {
    async fn find_distribution_set(
        &self,
        tenant_id: TenantId,
        distribution_set_id: DistributionSetId,
    ) -> AppResult<Option<DistributionSet>> {
        Ok(self
            .state
            .read()
            .await
            .distribution_sets
            .get(&(tenant_id, distribution_set_id))
            .cloned())
    }

    async fn save_distribution_set(
        &self,
        tenant_id: TenantId,
        distribution_set: DistributionSet,
    ) -> AppResult<()> {
        self.state
            .write()
            .await
            .distribution_sets
            .insert((tenant_id, distribution_set.id()), distribution_set);
        Ok(())
    }
}

#[async_trait]
impl RolloutRepository for InMemoryDeploymentRepository {
    async fn delete_soft_deleted_rollouts(
        &self,
        tenant_id: TenantId,
        limit: usize,
    ) -> AppResult<u64> {
        let mut state = self.state.write().await;
        let Some(rollouts) = state.deleted_rollouts.get_mut(&tenant_id) else {
            return Ok(0);
        };

        let purged: Vec<i64> = rollouts.iter().copied().take(limit).collect();
        for rollout_id in &purged {
            rollouts.remove(rollout_id);
        }

        Ok(purged.len() as u64)
    }
}
