//! Fleetgate control plane worker runtime.

#![forbid(unsafe_code)]

use std::env;
use std::sync::Arc;
use std::time::Duration;

use fleetgate_application::{
    ActionCleanupTask, ActionLifecycleService, AutoAssignConfig, AutoAssignScheduler,
    AutoAssignService, CleanupScheduler, DistributedLock, EventPublisher, RolloutCleanupTask,
    TenantSettings,
};
use fleetgate_core::{AppError, AppResult};
use fleetgate_domain::FilterMatcher;
use fleetgate_infrastructure::{
    HttpEventPublisher, InMemoryDistributedLock, PostgresDeploymentRepository,
    PostgresTenantConfiguration, RedisDistributedLock, TracingEventPublisher,
};
use sqlx::PgPool;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

static MIGRATOR: Migrator = sqlx::migrate!("../../crates/infrastructure/migrations");

#[derive(Debug, Clone)]
struct WorkerConfig {
    database_url: String,
    redis_url: Option<String>,
    event_webhook_url: Option<String>,
    auto_assign_interval: Duration,
    auto_assign_page_size: usize,
    cleanup_interval: Duration,
    lock_ttl_seconds: u32,
    rsql_ignore_case: bool,
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = WorkerConfig::load()?;
    let pool = connect_pool(config.database_url.as_str()).await?;
    MIGRATOR
        .run(&pool)
        .await
        .map_err(|error| AppError::Internal(format!("failed to run migrations: {error}")))?;

    let repository = Arc::new(PostgresDeploymentRepository::new(pool.clone()));
    let configuration = Arc::new(PostgresTenantConfiguration::new(pool));
    let settings = TenantSettings::new(configuration.clone());
    let lock = build_lock(&config).await?;
    let publisher = build_publisher(&config)?;

    let lifecycle = Arc::new(ActionLifecycleService::new(
        repository.clone(),
        repository.clone(),
        repository.clone(),
        settings.clone(),
        publisher.clone(),
    ));
    let auto_assign = AutoAssignService::new(
        repository.clone(),
        repository.clone(),
        repository.clone(),
        repository.clone(),
        lifecycle,
        lock.clone(),
        publisher,
    )
    .with_matcher(FilterMatcher::new(config.rsql_ignore_case))
    .with_config(AutoAssignConfig {
        page_size: config.auto_assign_page_size,
    });

    let cleanup = CleanupScheduler::new(configuration.clone(), lock, config.cleanup_interval)
        .with_task(Arc::new(ActionCleanupTask::new(
            repository.clone(),
            settings.clone(),
        )))
        .with_task(Arc::new(RolloutCleanupTask::new(repository, settings)));
    let scheduler =
        AutoAssignScheduler::new(auto_assign, configuration, config.auto_assign_interval);

    let shutdown_handles = [cleanup.shutdown_handle(), scheduler.shutdown_handle()];
    let tasks = [tokio::spawn(cleanup.run()), tokio::spawn(scheduler.run())];

    info!(
        auto_assign_interval_secs = config.auto_assign_interval.as_secs(),
        cleanup_interval_secs = config.cleanup_interval.as_secs(),
        "fleetgate-worker started"
    );

    if let Err(error) = tokio::signal::ctrl_c().await {
        error!(error = %error, "failed to listen for shutdown signal");
    }

    info!("shutdown requested; stopping background loops");
    for handle in &shutdown_handles {
        handle.notify_one();
    }
    for task in tasks {
        if let Err(error) = task.await {
            warn!(error = %error, "background loop terminated abnormally");
        }
    }

    info!("fleetgate-worker stopped");
    Ok(())
}

async fn connect_pool(database_url: &str) -> AppResult<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .map_err(|error| AppError::Internal(format!("failed to connect to database: {error}")))
}

async fn build_lock(config: &WorkerConfig) -> AppResult<Arc<dyn DistributedLock>> {
    let Some(redis_url) = config.redis_url.as_deref() else {
        warn!("REDIS_URL is not set; using a process-local lock, run a single node only");
        return Ok(Arc::new(InMemoryDistributedLock::new(Duration::from_secs(
            u64::from(config.lock_ttl_seconds),
        ))));
    };

    let client = redis::Client::open(redis_url)
        .map_err(|error| AppError::Validation(format!("invalid REDIS_URL: {error}")))?;
    let lock = RedisDistributedLock::connect(client, "fleetgate:lock", config.lock_ttl_seconds)
        .await?;

    Ok(Arc::new(lock))
}

fn build_publisher(config: &WorkerConfig) -> AppResult<Arc<dyn EventPublisher>> {
    let Some(endpoint) = config.event_webhook_url.as_deref() else {
        return Ok(Arc::new(TracingEventPublisher::new()));
    };

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|error| AppError::Internal(format!("failed to build HTTP client: {error}")))?;

    Ok(Arc::new(HttpEventPublisher::new(
        http_client,
        endpoint,
        3,
        250,
    )))
}

impl WorkerConfig {
    fn load() -> AppResult<Self> {
        let database_url = required_env("DATABASE_URL")?;
        let redis_url = optional_env("REDIS_URL");
        let event_webhook_url = optional_env("EVENT_WEBHOOK_URL");

        let auto_assign_interval_secs = parse_env_u64("AUTO_ASSIGN_INTERVAL_SECS", 60)?;
        let auto_assign_page_size = parse_env_usize(
            "AUTO_ASSIGN_PAGE_SIZE",
            AutoAssignConfig::default().page_size,
        )?;
        let cleanup_interval_secs = parse_env_u64("CLEANUP_INTERVAL_SECS", 3600)?;
        let lock_ttl_seconds = parse_env_u32("LOCK_TTL_SECONDS", 600)?;
        let rsql_ignore_case = parse_env_bool("RSQL_IGNORE_CASE", true)?;

        for (name, value) in [
            ("AUTO_ASSIGN_INTERVAL_SECS", auto_assign_interval_secs),
            ("AUTO_ASSIGN_PAGE_SIZE", auto_assign_page_size as u64),
            ("CLEANUP_INTERVAL_SECS", cleanup_interval_secs),
            ("LOCK_TTL_SECONDS", u64::from(lock_ttl_seconds)),
        ] {
            if value == 0 {
                return Err(AppError::Validation(format!(
                    "{name} must be greater than zero"
                )));
            }
        }

        Ok(Self {
            database_url,
            redis_url,
            event_webhook_url,
            auto_assign_interval: Duration::from_secs(auto_assign_interval_secs),
            auto_assign_page_size,
            cleanup_interval: Duration::from_secs(cleanup_interval_secs),
            lock_ttl_seconds,
            rsql_ignore_case,
        })
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

fn required_env(name: &str) -> AppResult<String> {
    env::var(name).map_err(|_| AppError::Validation(format!("{name} is required")))
}

fn optional_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_env_usize(name: &str, default: usize) -> AppResult<usize> {
    match env::var(name) {
        Ok(value) => value.parse::<usize>().map_err(|error| {
            AppError::Validation(format!("invalid {name} value '{value}': {error}"))
        }),
        Err(_) => Ok(default),
    }
}

fn parse_env_u32(name: &str, default: u32) -> AppResult<u32> {
    match env::var(name) {
        Ok(value) => value.parse::<u32>().map_err(|error| {
            AppError::Validation(format!("invalid {name} value '{value}': {error}"))
        }),
        Err(_) => Ok(default),
    }
}

fn parse_env_u64(name: &str, default: u64) -> AppResult<u64> {
    match env::var(name) {
        Ok(value) => value.parse::<u64>().map_err(|error| {
            AppError::Validation(format!("invalid {name} value '{value}': {error}"))
        }),
        Err(_) => Ok(default),
    }
}

fn parse_env_bool(name: &str, default: bool) -> AppResult<bool> {
    match env::var(name) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(AppError::Validation(format!(
                "invalid {name} value '{value}': expected a boolean"
            ))),
        },
        Err(_) => Ok(default),
    }
}
