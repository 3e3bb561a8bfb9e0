//! Application services and ports.

#![forbid(unsafe_code)]

mod action_service;
mod auto_assign_service;
mod cleanup_scheduler;
mod controller_service;
mod deployment_ports;
mod poll_buffer;
mod retry;
mod tenant_settings;

#[cfg(test)]
mod test_support;

pub use action_service::{ActionLifecycleConfig, ActionLifecycleService};
pub use auto_assign_service::{
    AutoAssignConfig, AutoAssignReport, AutoAssignScheduler, AutoAssignService,
    SingleTargetCheck,
};
pub use cleanup_scheduler::{
    ActionCleanupTask, CleanupScheduler, CleanupTask, CleanupTickReport, RolloutCleanupTask,
};
pub use controller_service::ControllerService;
pub use deployment_ports::{
    ActionRepository, ActionStatusChange, AssignmentWrite, CandidatePageQuery, ConfigValue,
    DeferredEvents, DeploymentEvent, DeploymentRequest, DeploymentResult, DeploymentSubmitter,
    DistributedLock, DistributionSetRepository, EventPublisher, LockKey, LockLease,
    RolloutRepository, TargetFilterQueryRepository, TargetRepository, TenantConfiguration,
    TenantDirectory, run_exclusive,
};
pub use poll_buffer::{
    FlushReport, PollBuffer, PollBufferConfig, PollBufferFlusher, PollPersistenceMode,
};
pub use retry::{RetryPolicy, retry_on_conflict};
pub use tenant_settings::{
    ACTION_CLEANUP_ENABLED, ACTION_CLEANUP_EXPIRY_MS, ACTION_CLEANUP_STATUS,
    AUTO_ASSIGN_ON_POLL_ENABLED, MULTI_ASSIGNMENTS_ENABLED, ROLLOUT_CLEANUP_ENABLED,
    TenantSettings,
};
