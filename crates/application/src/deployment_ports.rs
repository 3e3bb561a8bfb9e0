mod configuration;
mod events;
mod lock;
mod repository;
mod submitter;

pub use configuration::{ConfigValue, TenantConfiguration, TenantDirectory};
pub use events::{DeferredEvents, DeploymentEvent, EventPublisher};
pub use lock::{DistributedLock, LockKey, LockLease, run_exclusive};
pub use repository::{
    ActionRepository, ActionStatusChange, AssignmentWrite, CandidatePageQuery,
    DistributionSetRepository, RolloutRepository, TargetFilterQueryRepository, TargetRepository,
};
pub use submitter::{DeploymentRequest, DeploymentResult, DeploymentSubmitter};
