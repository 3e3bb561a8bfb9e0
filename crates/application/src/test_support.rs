use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use fleetgate_core::{AppError, AppResult, TenantId};
use fleetgate_domain::{
    Action, ActionId, ActionStatus, ActionStatusEntry, ActionStatusUpdate, ControllerId,
    DistributionSet, DistributionSetId, Target, TargetFilterQuery, TargetFilterQueryId,
};

use crate::action_service::ActionLifecycleService;
use crate::auto_assign_service::AutoAssignService;
use crate::deployment_ports::{
    ActionRepository, ActionStatusChange, AssignmentWrite, CandidatePageQuery, ConfigValue,
    DeploymentEvent, DistributedLock, DistributionSetRepository, EventPublisher, LockKey,
    LockLease, RolloutRepository, TargetFilterQueryRepository, TargetRepository,
    TenantConfiguration, TenantDirectory,
};
use crate::retry::RetryPolicy;
use crate::tenant_settings::TenantSettings;

pub(crate) fn controller(value: &str) -> ControllerId {
    ControllerId::new(value).unwrap_or_else(|_| unreachable!())
}

pub(crate) fn distribution_set(id: i64, type_key: &str) -> DistributionSet {
    DistributionSet::new(
        DistributionSetId::new(id),
        format!("set-{id}"),
        "1.0.0",
        type_key,
        true,
        false,
    )
    .unwrap_or_else(|_| unreachable!())
}

pub(crate) fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        backoff: Duration::from_millis(1),
    }
}

#[derive(Default)]
struct StoreState {
    targets: HashMap<(TenantId, ControllerId), Target>,
    actions: BTreeMap<ActionId, (TenantId, Action)>,
    entries: Vec<(TenantId, ActionStatusEntry)>,
    queries: Vec<(TenantId, TargetFilterQuery)>,
    distribution_sets: HashMap<(TenantId, DistributionSetId), DistributionSet>,
    soft_deleted_rollouts: HashMap<TenantId, u64>,
    next_action_id: i64,
    next_entry_id: i64,
    pending_conflicts: u32,
    touch_calls: Vec<(TenantId, Vec<ControllerId>)>,
    failing_touch_tenant: Option<TenantId>,
}

impl StoreState {
    fn append_entry(&mut self, tenant_id: TenantId, action_id: ActionId, update: ActionStatusUpdate) {
        self.next_entry_id += 1;
        self.entries.push((
            tenant_id,
            ActionStatusEntry::new(self.next_entry_id, action_id, update),
        ));
    }

    fn check_target_version(&self, tenant_id: TenantId, target: &Target) -> AppResult<()> {
        let stored = self
            .targets
            .get(&(tenant_id, target.controller_id().clone()))
            .ok_or_else(|| AppError::NotFound(format!("target '{}'", target.controller_id())))?;
        if stored.version() != target.version() {
            return Err(AppError::ConcurrencyConflict(format!(
                "target '{}' changed",
                target.controller_id()
            )));
        }
        Ok(())
    }

    fn check_action_version(&self, action: &Action) -> AppResult<()> {
        let (_, stored) = self
            .actions
            .get(&action.id())
            .ok_or_else(|| AppError::NotFound(format!("action '{}'", action.id())))?;
        if stored.version() != action.version() {
            return Err(AppError::ConcurrencyConflict(format!(
                "action '{}' changed",
                action.id()
            )));
        }
        Ok(())
    }

    fn store_target(&mut self, tenant_id: TenantId, mut target: Target) -> Target {
        target.set_version(target.version() + 1);
        self.targets.insert(
            (tenant_id, target.controller_id().clone()),
            target.clone(),
        );
        target
    }

    fn store_action(&mut self, tenant_id: TenantId, mut action: Action) -> Action {
        action.set_version(action.version() + 1);
        self.actions.insert(action.id(), (tenant_id, action.clone()));
        action
    }
}

/// In-process fake of every repository port.
#[derive(Default)]
pub(crate) struct FakeStore {
    state: Mutex<StoreState>,
}

impl FakeStore {
    pub(crate) async fn insert_target(&self, tenant_id: TenantId, target: Target) {
        self.state
            .lock()
            .await
            .targets
            .insert((tenant_id, target.controller_id().clone()), target);
    }

    pub(crate) async fn insert_distribution_set(
        &self,
        tenant_id: TenantId,
        distribution_set: DistributionSet,
    ) {
        self.state
            .lock()
            .await
            .distribution_sets
            .insert((tenant_id, distribution_set.id()), distribution_set);
    }

    pub(crate) async fn insert_query(&self, tenant_id: TenantId, query: TargetFilterQuery) {
        self.state.lock().await.queries.push((tenant_id, query));
    }

    pub(crate) async fn target(
        &self,
        tenant_id: TenantId,
        controller_id: &ControllerId,
    ) -> Option<Target> {
        self.state
            .lock()
            .await
            .targets
            .get(&(tenant_id, controller_id.clone()))
            .cloned()
    }

    pub(crate) async fn actions_for(
        &self,
        tenant_id: TenantId,
        controller_id: &ControllerId,
    ) -> Vec<Action> {
        self.state
            .lock()
            .await
            .actions
            .values()
            .filter(|(stored_tenant, action)| {
                *stored_tenant == tenant_id && action.controller_id() == controller_id
            })
            .map(|(_, action)| action.clone())
            .collect()
    }

    pub(crate) async fn action_count(&self) -> usize {
        self.state.lock().await.actions.len()
    }

    pub(crate) async fn inject_conflicts(&self, count: u32) {
        self.state.lock().await.pending_conflicts = count;
    }

    pub(crate) async fn touch_calls(&self) -> Vec<(TenantId, Vec<ControllerId>)> {
        self.state.lock().await.touch_calls.clone()
    }

    pub(crate) async fn fail_touch_for(&self, tenant_id: TenantId) {
        self.state.lock().await.failing_touch_tenant = Some(tenant_id);
    }

    pub(crate) async fn set_soft_deleted_rollouts(&self, tenant_id: TenantId, count: u64) {
        self.state
            .lock()
            .await
            .soft_deleted_rollouts
            .insert(tenant_id, count);
    }

    pub(crate) async fn soft_deleted_rollouts(&self, tenant_id: TenantId) -> u64 {
        self.state
            .lock()
            .await
            .soft_deleted_rollouts
            .get(&tenant_id)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl TargetRepository for FakeStore {
    async fn find_target(
        &self,
        tenant_id: TenantId,
        controller_id: &ControllerId,
    ) -> AppResult<Option<Target>> {
        Ok(self.target(tenant_id, controller_id).await)
    }

    async fn create_target(&self, tenant_id: TenantId, target: Target) -> AppResult<Target> {
        let mut state = self.state.lock().await;
        if state
            .targets
            .contains_key(&(tenant_id, target.controller_id().clone()))
        {
            return Err(AppError::AlreadyExists(format!(
                "target '{}'",
                target.controller_id()
            )));
        }
        Ok(state.store_target(tenant_id, target))
    }

    async fn update_target(&self, tenant_id: TenantId, target: Target) -> AppResult<Target> {
        let mut state = self.state.lock().await;
        state.check_target_version(tenant_id, &target)?;
        Ok(state.store_target(tenant_id, target))
    }

    async fn touch_last_poll(
        &self,
        tenant_id: TenantId,
        controller_ids: &[ControllerId],
        polled_at: DateTime<Utc>,
    ) -> AppResult<u64> {
        let mut state = self.state.lock().await;
        state.touch_calls.push((tenant_id, controller_ids.to_vec()));
        if state.failing_touch_tenant == Some(tenant_id) {
            return Err(AppError::Internal("touch failed".to_owned()));
        }

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
        if let Some(target) = self
            .state
            .lock()
            .await
            .targets
            .get_mut(&(tenant_id, controller_id.clone()))
        {
            target.mark_request_attributes();
        }
        Ok(())
    }

    async fn list_auto_assign_candidates(
        &self,
        tenant_id: TenantId,
        query: CandidatePageQuery,
    ) -> AppResult<Vec<Target>> {
        let state = self.state.lock().await;
        let mut candidates: Vec<Target> = state
            .targets
            .iter()
            .filter(|((stored_tenant, controller_id), target)| {
                *stored_tenant == tenant_id
                    && query
                        .after
                        .as_ref()
                        .is_none_or(|after| controller_id > after)
                    && target.assigned_distribution_set() != Some(query.distribution_set_id)
                    && !state.actions.values().any(|(action_tenant, action)| {
                        *action_tenant == tenant_id
                            && action.controller_id() == controller_id
                            && action.distribution_set_id() == query.distribution_set_id
                    })
            })
            .map(|(_, target)| target.clone())
            .collect();

        candidates.sort_by(|left, right| left.controller_id().cmp(right.controller_id()));
        candidates.truncate(query.limit);
        Ok(candidates)
    }
}

#[async_trait]
impl ActionRepository for FakeStore {
    async fn find_action(
        &self,
        tenant_id: TenantId,
        action_id: ActionId,
    ) -> AppResult<Option<Action>> {
        Ok(self
            .state
            .lock()
            .await
            .actions
            .get(&action_id)
            .filter(|(stored_tenant, _)| *stored_tenant == tenant_id)
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
            .into_iter()
            .last())
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
        Ok(self
            .state
            .lock()
            .await
            .entries
            .iter()
            .filter(|(stored_tenant, entry)| {
                *stored_tenant == tenant_id && entry.action_id() == action_id
            })
            .map(|(_, entry)| entry.clone())
            .collect())
    }

    async fn list_active_actions(
        &self,
        tenant_id: TenantId,
        controller_id: &ControllerId,
    ) -> AppResult<Vec<Action>> {
        Ok(self
            .actions_for(tenant_id, controller_id)
            .await
            .into_iter()
            .filter(Action::is_active)
            .collect())
    }

    async fn count_actions_for_target(
        &self,
        tenant_id: TenantId,
        controller_id: &ControllerId,
    ) -> AppResult<u64> {
        Ok(self.actions_for(tenant_id, controller_id).await.len() as u64)
    }

    async fn has_action_for_distribution_set(
        &self,
        tenant_id: TenantId,
        controller_id: &ControllerId,
        distribution_set_id: DistributionSetId,
    ) -> AppResult<bool> {
        Ok(self
            .actions_for(tenant_id, controller_id)
            .await
            .iter()
            .any(|action| action.distribution_set_id() == distribution_set_id))
    }

    async fn save_status_change(
        &self,
        tenant_id: TenantId,
        change: ActionStatusChange,
    ) -> AppResult<Action> {
        let mut state = self.state.lock().await;
        if state.pending_conflicts > 0 {
            state.pending_conflicts -= 1;
            return Err(AppError::ConcurrencyConflict("injected".to_owned()));
        }

        state.check_action_version(&change.action)?;
        if let Some(target) = &change.target {
            state.check_target_version(tenant_id, target)?;
        }

        if let Some(entry) = change.entry {
            state.append_entry(tenant_id, change.action.id(), entry);
        }
        if let Some(target) = change.target {
            state.store_target(tenant_id, target);
        }
        Ok(state.store_action(tenant_id, change.action))
    }

    async fn save_assignments(
        &self,
        tenant_id: TenantId,
        writes: Vec<AssignmentWrite>,
    ) -> AppResult<Vec<Action>> {
        let mut state = self.state.lock().await;
        for write in &writes {
            state.check_target_version(tenant_id, &write.target)?;
            for (action, _) in &write.superseded {
                state.check_action_version(action)?;
            }
        }

        let mut created = Vec::new();
        for write in writes {
            state.store_target(tenant_id, write.target);
            for (action, entry) in write.superseded {
                state.append_entry(tenant_id, action.id(), entry);
                state.store_action(tenant_id, action);
            }
            for new_action in write.new_actions {
                state.next_action_id += 1;
                let action = Action::create(
                    ActionId::new(state.next_action_id),
                    new_action,
                    write.created_at,
                )?;
                state.append_entry(
                    tenant_id,
                    action.id(),
                    ActionStatusUpdate::new(ActionStatus::Running, write.created_at),
                );
                created.push(state.store_action(tenant_id, action));
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
        let mut state = self.state.lock().await;
        let expired: Vec<ActionId> = state
            .actions
            .values()
            .filter(|(stored_tenant, action)| {
                *stored_tenant == tenant_id
                    && !action.is_active()
                    && statuses.contains(&action.status())
                    && action.last_modified_at() < modified_before
            })
            .map(|(_, action)| action.id())
            .take(limit)
            .collect();

        for action_id in &expired {
            state.actions.remove(action_id);
        }
        state
            .entries
            .retain(|(_, entry)| !expired.contains(&entry.action_id()));

        Ok(expired.len() as u64)
    }
}

#[async_trait]
impl TargetFilterQueryRepository for FakeStore {
    async fn list_auto_assign_queries(
        &self,
        tenant_id: TenantId,
    ) -> AppResult<Vec<TargetFilterQuery>> {
        let mut queries: Vec<TargetFilterQuery> = self
            .state
            .lock()
            .await
            .queries
            .iter()
            .filter(|(stored_tenant, query)| {
                *stored_tenant == tenant_id && query.auto_assignment().is_some()
            })
            .map(|(_, query)| query.clone())
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
            .lock()
            .await
            .queries
            .iter()
            .find(|(stored_tenant, query)| *stored_tenant == tenant_id && query.id() == query_id)
            .map(|(_, query)| query.clone()))
    }

    async fn save_filter_query(
        &self,
        tenant_id: TenantId,
        query: TargetFilterQuery,
    ) -> AppResult<()> {
        let mut state = self.state.lock().await;
        state
            .queries
            .retain(|(stored_tenant, stored)| *stored_tenant != tenant_id || stored.id() != query.id());
        state.queries.push((tenant_id, query));
        Ok(())
    }
}

#[async_trait]
impl DistributionSetRepository for FakeStore {
    async fn find_distribution_set(
        &self,
        tenant_id: TenantId,
        distribution_set_id: DistributionSetId,
    ) -> AppResult<Option<DistributionSet>> {
        Ok(self
            .state
            .lock()
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
        self.insert_distribution_set(tenant_id, distribution_set)
            .await;
        Ok(())
    }
}

#[async_trait]
impl RolloutRepository for FakeStore {
    async fn delete_soft_deleted_rollouts(
        &self,
        tenant_id: TenantId,
        limit: usize,
    ) -> AppResult<u64> {
        let mut state = self.state.lock().await;
        let remaining = state.soft_deleted_rollouts.entry(tenant_id).or_default();
        let deleted = (*remaining).min(limit as u64);
        *remaining -= deleted;
        Ok(deleted)
    }
}

/// Lock fake that can also simulate a lock held by another node.
#[derive(Default)]
pub(crate) struct FakeLock {
    held: Mutex<HashSet<String>>,
    released: Mutex<Vec<String>>,
}

impl FakeLock {
    pub(crate) async fn hold_elsewhere(&self, key: &LockKey) {
        self.held.lock().await.insert(key.as_str().to_owned());
    }

    pub(crate) async fn released(&self) -> Vec<String> {
        self.released.lock().await.clone()
    }
}

#[async_trait]
impl DistributedLock for FakeLock {
    async fn try_acquire(&self, key: &LockKey) -> AppResult<Option<LockLease>> {
        if !self.held.lock().await.insert(key.as_str().to_owned()) {
            return Ok(None);
        }

        Ok(Some(LockLease {
            key: key.clone(),
            token: format!("token:{key}"),
        }))
    }

    async fn release(&self, lease: &LockLease) -> AppResult<()> {
        self.held.lock().await.remove(lease.key.as_str());
        self.released
            .lock()
            .await
            .push(lease.key.as_str().to_owned());
        Ok(())
    }
}

/// Configuration and tenant directory fake.
#[derive(Default)]
pub(crate) struct FakeConfiguration {
    values: Mutex<HashMap<String, ConfigValue>>,
    tenants: Mutex<Vec<TenantId>>,
}

impl FakeConfiguration {
    pub(crate) async fn set(&self, key: &str, value: ConfigValue) {
        self.values.lock().await.insert(key.to_owned(), value);
    }

    pub(crate) async fn add_tenant(&self, tenant_id: TenantId) {
        self.tenants.lock().await.push(tenant_id);
    }
}

#[async_trait]
impl TenantConfiguration for FakeConfiguration {
    async fn get_value(&self, _tenant_id: TenantId, key: &str) -> AppResult<Option<ConfigValue>> {
        Ok(self.values.lock().await.get(key).cloned())
    }
}

#[async_trait]
impl TenantDirectory for FakeConfiguration {
    async fn list_tenants(&self) -> AppResult<Vec<TenantId>> {
        Ok(self.tenants.lock().await.clone())
    }
}

#[derive(Default)]
pub(crate) struct RecordingPublisher {
    events: Mutex<Vec<DeploymentEvent>>,
}

impl RecordingPublisher {
    pub(crate) async fn events(&self) -> Vec<DeploymentEvent> {
        self.events.lock().await.clone()
    }

    pub(crate) async fn names(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .await
            .iter()
            .map(DeploymentEvent::name)
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, event: &DeploymentEvent) -> AppResult<()> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

/// Wires fakes and services for one tenant.
pub(crate) struct Harness {
    pub(crate) tenant_id: TenantId,
    pub(crate) store: Arc<FakeStore>,
    pub(crate) configuration: Arc<FakeConfiguration>,
    pub(crate) lock: Arc<FakeLock>,
    pub(crate) publisher: Arc<RecordingPublisher>,
}

impl Harness {
    pub(crate) fn new() -> Self {
        Self {
            tenant_id: TenantId::new(),
            store: Arc::new(FakeStore::default()),
            configuration: Arc::new(FakeConfiguration::default()),
            lock: Arc::new(FakeLock::default()),
            publisher: Arc::new(RecordingPublisher::default()),
        }
    }

    pub(crate) fn settings(&self) -> TenantSettings {
        TenantSettings::new(self.configuration.clone())
    }

    pub(crate) fn action_service(&self) -> ActionLifecycleService {
        ActionLifecycleService::new(
            self.store.clone(),
            self.store.clone(),
            self.store.clone(),
            self.settings(),
            self.publisher.clone(),
        )
        .with_config(crate::action_service::ActionLifecycleConfig {
            retry: fast_retry(),
            ..Default::default()
        })
    }

    pub(crate) fn auto_assign_service(&self) -> AutoAssignService {
        AutoAssignService::new(
            self.store.clone(),
            self.store.clone(),
            self.store.clone(),
            self.store.clone(),
            Arc::new(self.action_service()),
            self.lock.clone(),
            self.publisher.clone(),
        )
    }

    /// Registers a target and a complete distribution set of type `os`.
    pub(crate) async fn seed(&self, controller_id: &str, distribution_set_id: i64) -> ControllerId {
        let controller_id = controller(controller_id);
        self.store
            .insert_target(
                self.tenant_id,
                Target::register(controller_id.clone(), None, None, Utc::now()),
            )
            .await;
        self.store
            .insert_distribution_set(self.tenant_id, distribution_set(distribution_set_id, "os"))
            .await;
        controller_id
    }
}
