//! Infrastructure adapters for application ports.

#![forbid(unsafe_code)]

mod http_event_publisher;
mod in_memory_deployment_repository;
mod in_memory_distributed_lock;
mod in_memory_tenant_configuration;
mod postgres_deployment_repository;
mod postgres_tenant_configuration;
mod redis_distributed_lock;
mod tracing_event_publisher;

pub use http_event_publisher::HttpEventPublisher;
pub use in_memory_deployment_repository::InMemoryDeploymentRepository;
pub use in_memory_distributed_lock::InMemoryDistributedLock;
pub use in_memory_tenant_configuration::InMemoryTenantConfiguration;
pub use postgres_deployment_repository::PostgresDeploymentRepository;
pub use postgres_tenant_configuration::PostgresTenantConfiguration;
pub use redis_distributed_lock::RedisDistributedLock;
pub use tracing_event_publisher::TracingEventPublisher;
