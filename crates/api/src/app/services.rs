//! Infrastructure wiring: stores, providers and the engine components built on them.
//!
//! `DATABASE_URL` selects Postgres stores, otherwise everything is in memory
//! (dev mode). Each provider URL selects its HTTP client, otherwise the
//! in-memory fake is used.

use std::sync::Arc;

use tracing::{info, warn};

use rewardflow_core::TenantId;
use rewardflow_infra::config::EngineConfig;
use rewardflow_infra::db;
use rewardflow_infra::jobs::{
    DeadLetterSink, Enqueuer, InMemoryDeadLetterSink, InMemoryJobStore, JobAdmin, JobStore,
    PostgresDeadLetterSink, PostgresJobStore, Reaper, RetryController, StagePipeline,
    StatusProjection, Worker, WorkerConfig,
};
use rewardflow_infra::providers::{
    HttpNotificationProvider, HttpRewardProvider, HttpTenantResolver,
    InMemoryNotificationProvider, InMemoryRewardProvider, InMemoryTenantResolver,
    NotificationProvider, ProviderError, RewardProvider, TenantResolver,
};
use rewardflow_infra::runs::{InMemoryRunStore, PostgresRunStore, RunStore};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("database setup failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("provider client setup failed: {0}")]
    Provider(#[from] ProviderError),
}

/// What the HTTP handlers need.
pub struct AppServices {
    pub enqueuer: Enqueuer,
    pub status: StatusProjection,
    pub admin: JobAdmin,
}

/// Everything a process runs: HTTP services plus the background loops.
pub struct Engine {
    pub services: Arc<AppServices>,
    pub worker: Worker,
    pub reaper: Reaper,
}

pub struct Stores {
    pub jobs: Arc<dyn JobStore>,
    pub runs: Arc<dyn RunStore>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            jobs: Arc::new(InMemoryJobStore::new()),
            runs: Arc::new(InMemoryRunStore::new()),
            dead_letters: Arc::new(InMemoryDeadLetterSink::new()),
        }
    }

    async fn from_config(config: &EngineConfig) -> Result<Self, ServiceError> {
        let Some(database) = &config.database else {
            warn!("DATABASE_URL not set; using in-memory stores (dev mode)");
            return Ok(Self::in_memory());
        };
        let pool = db::connect(database).await?;
        db::install_schema(&pool).await?;
        Ok(Self {
            jobs: Arc::new(PostgresJobStore::new(pool.clone())),
            runs: Arc::new(PostgresRunStore::new(pool.clone())),
            dead_letters: Arc::new(PostgresDeadLetterSink::new(pool)),
        })
    }
}

pub struct Providers {
    pub resolver: Arc<dyn TenantResolver>,
    pub rewards: Arc<dyn RewardProvider>,
    pub notifier: Arc<dyn NotificationProvider>,
}

impl Providers {
    /// Fakes that resolve every identifier to one tenant.
    pub fn in_memory() -> Self {
        Self {
            resolver: Arc::new(InMemoryTenantResolver::with_fallback(TenantId::new())),
            rewards: Arc::new(InMemoryRewardProvider::new()),
            notifier: Arc::new(InMemoryNotificationProvider::new()),
        }
    }

    fn from_config(config: &EngineConfig) -> Result<Self, ServiceError> {
        let endpoints = &config.providers;

        let resolver: Arc<dyn TenantResolver> = match &endpoints.tenant_resolver_url {
            Some(url) => Arc::new(HttpTenantResolver::new(url, endpoints.timeout)?),
            None => {
                let tenant = TenantId::new();
                info!(%tenant, "TENANT_RESOLVER_URL not set; resolving every trigger to one tenant");
                Arc::new(InMemoryTenantResolver::with_fallback(tenant))
            }
        };
        let rewards: Arc<dyn RewardProvider> = match &endpoints.reward_url {
            Some(url) => Arc::new(HttpRewardProvider::new(url, endpoints.timeout)?),
            None => {
                warn!("REWARD_PROVIDER_URL not set; using in-memory reward provider");
                Arc::new(InMemoryRewardProvider::new())
            }
        };
        let notifier: Arc<dyn NotificationProvider> = match &endpoints.notification_url {
            Some(url) => Arc::new(HttpNotificationProvider::new(url, endpoints.timeout)?),
            None => {
                warn!("NOTIFICATION_PROVIDER_URL not set; using in-memory notification provider");
                Arc::new(InMemoryNotificationProvider::new())
            }
        };
        Ok(Self {
            resolver,
            rewards,
            notifier,
        })
    }
}

/// Build stores and providers from configuration, then assemble the engine.
pub async fn build_engine(config: &EngineConfig) -> Result<Engine, ServiceError> {
    let stores = Stores::from_config(config).await?;
    let providers = Providers::from_config(config)?;
    Ok(assemble(config, stores, providers))
}

/// Wire engine components over already-built stores and providers.
pub fn assemble(config: &EngineConfig, stores: Stores, providers: Providers) -> Engine {
    let Stores {
        jobs,
        runs,
        dead_letters,
    } = stores;

    let pipeline = StagePipeline::standard(
        jobs.clone(),
        providers.resolver,
        providers.rewards,
        providers.notifier,
    );
    let retry = RetryController::new(jobs.clone(), dead_letters.clone(), config.retry.clone());
    let worker = Worker::new(
        jobs.clone(),
        pipeline,
        retry,
        WorkerConfig::default()
            .with_worker_id(config.worker_id.clone())
            .with_batch_size(config.claim_batch_size)
            .with_poll_interval(config.poll_interval),
    );
    let reaper = Reaper::new(
        jobs.clone(),
        dead_letters,
        config.lease_timeout,
        config.reaper_interval,
    );

    let services = AppServices {
        enqueuer: Enqueuer::new(
            jobs.clone(),
            runs,
            config.programs.clone(),
            config.retry.max_attempts,
        ),
        status: StatusProjection::new(jobs.clone(), config.stuck_threshold),
        admin: JobAdmin::new(jobs, config.stuck_threshold),
    };

    Engine {
        services: Arc::new(services),
        worker,
        reaper,
    }
}
