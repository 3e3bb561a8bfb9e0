use std::sync::Arc;

use fleetgate_core::{AppError, AppResult, TenantId};
use fleetgate_domain::{
    AutoAssignment, ControllerId, DistributionSet, FilterExpression, FilterMatcher, Target,
    TargetFilterQuery, TargetFilterQueryId,
};
use tracing::{debug, error, info, warn};

use crate::deployment_ports::{
    ActionRepository, CandidatePageQuery, DeferredEvents, DeploymentEvent, DeploymentRequest,
    DeploymentSubmitter, DistributedLock, DistributionSetRepository, EventPublisher, LockKey,
    TargetFilterQueryRepository, TargetRepository, run_exclusive,
};

mod scheduler;

pub use scheduler::AutoAssignScheduler;

/// Auto-assignment settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoAssignConfig {
    /// Candidate targets fetched per page.
    pub page_size: usize,
}

impl Default for AutoAssignConfig {
    fn default() -> Self {
        Self { page_size: 1000 }
    }
}

/// Outcome of one fleet-wide sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AutoAssignReport {
    /// False when another node held the tenant lock.
    pub lock_acquired: bool,
    /// Queries evaluated successfully.
    pub queries_processed: usize,
    /// Queries that failed and were skipped.
    pub queries_failed: usize,
    /// Actions created across all queries.
    pub actions_created: usize,
}

/// Outcome of a single-target check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SingleTargetCheck {
    /// The target matched a query and received its distribution set.
    Assigned {
        /// Matching query.
        query_id: TargetFilterQueryId,
    },
    /// No query matched.
    NoMatch,
    /// The tenant lock was held elsewhere; the controller was asked to
    /// push its attributes again.
    Deferred,
}

/// Assigns distribution sets to targets matching auto-assign filter queries.
#[derive(Clone)]
pub struct AutoAssignService {
    filter_queries: Arc<dyn TargetFilterQueryRepository>,
    targets: Arc<dyn TargetRepository>,
    actions: Arc<dyn ActionRepository>,
    distribution_sets: Arc<dyn DistributionSetRepository>,
    submitter: Arc<dyn DeploymentSubmitter>,
    lock: Arc<dyn DistributedLock>,
    publisher: Arc<dyn EventPublisher>,
    matcher: FilterMatcher,
    config: AutoAssignConfig,
}

struct PreparedQuery {
    query: TargetFilterQuery,
    assignment: AutoAssignment,
    expression: FilterExpression,
}

impl AutoAssignService {
    /// Creates an auto-assign service.
    #[must_use]
    pub fn new(
        filter_queries: Arc<dyn TargetFilterQueryRepository>,
        targets: Arc<dyn TargetRepository>,
        actions: Arc<dyn ActionRepository>,
        distribution_sets: Arc<dyn DistributionSetRepository>,
        submitter: Arc<dyn DeploymentSubmitter>,
        lock: Arc<dyn DistributedLock>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            filter_queries,
            targets,
            actions,
            distribution_sets,
            submitter,
            lock,
            publisher,
            matcher: FilterMatcher::default(),
            config: AutoAssignConfig::default(),
        }
    }

    /// Overrides the filter matcher.
    #[must_use]
    pub fn with_matcher(mut self, matcher: FilterMatcher) -> Self {
        self.matcher = matcher;
        self
    }

    /// Overrides paging settings.
    #[must_use]
    pub fn with_config(mut self, config: AutoAssignConfig) -> Self {
        self.config = config;
        self
    }

    /// Runs every auto-assign query against the whole fleet of one tenant.
    ///
    /// Returns immediately with `lock_acquired == false` when another node
    /// holds the tenant lock.
    pub async fn check_all_targets(&self, tenant_id: TenantId) -> AppResult<AutoAssignReport> {
        let key = LockKey::auto_assign(tenant_id);
        let report = run_exclusive(self.lock.as_ref(), &key, || self.sweep(tenant_id)).await?;

        match report {
            Some(report) => Ok(report),
            None => {
                debug!(tenant_id = %tenant_id, "auto assign lock held elsewhere; sweep skipped");
                Ok(AutoAssignReport::default())
            }
        }
    }

    /// Assigns the first matching query's distribution set to one target.
    pub async fn check_single_target(
        &self,
        tenant_id: TenantId,
        controller_id: &ControllerId,
    ) -> AppResult<SingleTargetCheck> {
        let key = LockKey::auto_assign(tenant_id);
        let outcome = run_exclusive(self.lock.as_ref(), &key, || {
            self.check_target(tenant_id, controller_id)
        })
        .await?;

        if let Some(outcome) = outcome {
            return Ok(outcome);
        }

        debug!(
            tenant_id = %tenant_id,
            controller_id = %controller_id,
            "auto assign lock held elsewhere; requesting attributes for retry"
        );
        self.targets
            .mark_request_attributes(tenant_id, controller_id)
            .await?;

        let mut events = DeferredEvents::new();
        events.push(DeploymentEvent::AttributesRequested {
            tenant_id,
            controller_id: controller_id.clone(),
        });
        events.publish_all(self.publisher.as_ref()).await;

        Ok(SingleTargetCheck::Deferred)
    }

    async fn sweep(&self, tenant_id: TenantId) -> AppResult<AutoAssignReport> {
        let mut report = AutoAssignReport {
            lock_acquired: true,
            ..AutoAssignReport::default()
        };

        for query in self.filter_queries.list_auto_assign_queries(tenant_id).await? {
            let query_id = query.id();
            match self.run_query(tenant_id, query).await {
                Ok(created) => {
                    report.queries_processed += 1;
                    report.actions_created += created;
                }
                Err(error) => {
                    report.queries_failed += 1;
                    error!(
                        tenant_id = %tenant_id,
                        filter_query_id = %query_id,
                        error = %error,
                        "auto assign query failed"
                    );
                }
            }
        }

        info!(
            tenant_id = %tenant_id,
            queries_processed = report.queries_processed,
            queries_failed = report.queries_failed,
            actions_created = report.actions_created,
            "auto assign sweep finished"
        );
        Ok(report)
    }

    async fn run_query(&self, tenant_id: TenantId, query: TargetFilterQuery) -> AppResult<usize> {
        let Some(prepared) = prepare(query)? else {
            return Ok(0);
        };
        let distribution_set = self
            .assignable_set(tenant_id, &prepared.assignment)
            .await?;

        let page_size = self.config.page_size.max(1);
        let mut after: Option<ControllerId> = None;
        let mut created = 0;

        loop {
            let page = self
                .targets
                .list_auto_assign_candidates(
                    tenant_id,
                    CandidatePageQuery {
                        distribution_set_id: distribution_set.id(),
                        after: after.clone(),
                        limit: page_size,
                    },
                )
                .await?;
            let page_len = page.len();
            after = page.last().map(|target| target.controller_id().clone());

            let requests: Vec<DeploymentRequest> = page
                .iter()
                .filter(|target| self.accepts(&prepared, &distribution_set, target))
                .map(|target| request_for(&prepared, target.controller_id().clone()))
                .collect();

            if !requests.is_empty() {
                created += self.submitter.submit(tenant_id, requests).await?.assigned.len();
            }

            if page_len < page_size {
                break;
            }
        }

        Ok(created)
    }

    async fn check_target(
        &self,
        tenant_id: TenantId,
        controller_id: &ControllerId,
    ) -> AppResult<SingleTargetCheck> {
        let Some(target) = self.targets.find_target(tenant_id, controller_id).await? else {
            return Ok(SingleTargetCheck::NoMatch);
        };

        for query in self.filter_queries.list_auto_assign_queries(tenant_id).await? {
            let query_id = query.id();
            let prepared = match prepare(query) {
                Ok(Some(prepared)) => prepared,
                Ok(None) => continue,
                Err(error) => {
                    warn!(
                        tenant_id = %tenant_id,
                        filter_query_id = %query_id,
                        error = %error,
                        "skipping unparseable auto assign query"
                    );
                    continue;
                }
            };

            let distribution_set_id = prepared.assignment.distribution_set_id();
            if target.assigned_distribution_set() == Some(distribution_set_id)
                || self
                    .actions
                    .has_action_for_distribution_set(tenant_id, controller_id, distribution_set_id)
                    .await?
            {
                continue;
            }

            let distribution_set = match self.assignable_set(tenant_id, &prepared.assignment).await
            {
                Ok(distribution_set) => distribution_set,
                Err(error) => {
                    warn!(
                        tenant_id = %tenant_id,
                        filter_query_id = %query_id,
                        error = %error,
                        "skipping auto assign query without assignable distribution set"
                    );
                    continue;
                }
            };

            if !self.accepts(&prepared, &distribution_set, &target) {
                continue;
            }

            self.submitter
                .submit(tenant_id, vec![request_for(&prepared, controller_id.clone())])
                .await?;

            info!(
                tenant_id = %tenant_id,
                controller_id = %controller_id,
                filter_query_id = %query_id,
                distribution_set_id = %distribution_set_id,
                "auto assigned distribution set to target"
            );
            return Ok(SingleTargetCheck::Assigned { query_id });
        }

        Ok(SingleTargetCheck::NoMatch)
    }

    async fn assignable_set(
        &self,
        tenant_id: TenantId,
        assignment: &AutoAssignment,
    ) -> AppResult<DistributionSet> {
        let distribution_set_id = assignment.distribution_set_id();
        let distribution_set = self
            .distribution_sets
            .find_distribution_set(tenant_id, distribution_set_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "distribution set '{distribution_set_id}' does not exist"
                ))
            })?;

        if !distribution_set.is_assignable() {
            return Err(AppError::InvalidState(format!(
                "distribution set '{distribution_set_id}' is incomplete or deleted"
            )));
        }

        Ok(distribution_set)
    }

    fn accepts(
        &self,
        prepared: &PreparedQuery,
        distribution_set: &DistributionSet,
        target: &Target,
    ) -> bool {
        target.is_compatible_with(distribution_set)
            && self
                .matcher
                .matches(&prepared.expression, &target.field_data())
    }
}

fn prepare(query: TargetFilterQuery) -> AppResult<Option<PreparedQuery>> {
    let Some(assignment) = query.auto_assignment().cloned() else {
        return Ok(None);
    };
    let expression = FilterExpression::parse(query.query())?;

    Ok(Some(PreparedQuery {
        query,
        assignment,
        expression,
    }))
}

fn request_for(prepared: &PreparedQuery, controller_id: ControllerId) -> DeploymentRequest {
    DeploymentRequest {
        controller_id,
        distribution_set_id: prepared.assignment.distribution_set_id(),
        action_type: prepared.assignment.action_type(),
        weight: prepared.assignment.weight(),
        maintenance_window: None,
        initiated_by: Some(prepared.query.auto_assign_initiator()),
    }
}

#[cfg(test)]
mod tests;
