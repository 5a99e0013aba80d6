//! Service wiring: broker, job store/queue, worker pool, scheduler.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;

use recordchain_core::OrgId;
use recordchain_infra::config::Config;
use recordchain_infra::jobs::{
    InMemoryJobQueue, InMemoryJobStore, JobQueue, JobStore, Scheduler, SchedulerConfig, SchedulerHandle,
    SubmitPipeline, WorkerPool, WorkerPoolConfig, WorkerPoolHandle,
};
use recordchain_ledger::{BrokerConfig, IdentityStore, InMemoryWallet, LedgerNetwork, NetworkBroker};

/// What request handlers need.
pub struct AppServices {
    pub pipeline: SubmitPipeline,
    /// API key → organization it authenticates as
    pub api_keys: HashMap<String, OrgId>,
}

/// Running background services plus the handler-facing [`AppServices`].
pub struct Runtime {
    pub services: Arc<AppServices>,
    pool: WorkerPoolHandle,
    scheduler: Option<SchedulerHandle>,
}

impl Runtime {
    /// Connect every configured organization and start the worker pool (and
    /// the scheduler, if enabled) against `network`.
    pub async fn start(config: &Config, network: Arc<dyn LedgerNetwork>) -> anyhow::Result<Self> {
        let wallet = InMemoryWallet::new();
        for org in &config.orgs {
            wallet
                .put(org.identity())
                .await
                .with_context(|| format!("failed to store the {} identity", org.org))?;
        }

        let broker = Arc::new(NetworkBroker::new(
            network,
            Arc::new(wallet),
            config.orgs.iter().map(|o| o.profile()),
            BrokerConfig {
                channel: config.ledger.channel.clone(),
                chaincode: config.ledger.chaincode.clone(),
                options: config.ledger.gateway,
            },
        ));
        broker
            .connect_all()
            .await
            .context("failed to connect to the ledger network")?;

        let (store, queue) = job_backend(config).await?;
        let pipeline = SubmitPipeline::new(
            store,
            queue,
            broker,
            &config.ledger.gateway,
            config.jobs.retry,
        );

        let pool = WorkerPool::new(
            pipeline.clone(),
            WorkerPoolConfig::default()
                .with_concurrency(config.jobs.concurrency)
                .with_lease(config.jobs.lease),
        )
        .spawn();

        let scheduler = config.jobs.scheduler.then(|| {
            Scheduler::new(
                pipeline.store().clone(),
                pipeline.queue().clone(),
                SchedulerConfig::default()
                    .with_poll_interval(config.jobs.poll_interval)
                    .with_requeue_after(config.jobs.requeue_after),
            )
            .spawn()
        });
        if scheduler.is_none() {
            tracing::info!("scheduler disabled in this process");
        }

        let api_keys = config
            .orgs
            .iter()
            .filter_map(|o| o.api_key.clone().map(|key| (key, o.org.clone())))
            .collect();

        Ok(Self {
            services: Arc::new(AppServices { pipeline, api_keys }),
            pool,
            scheduler,
        })
    }

    /// Scheduler first, then the pool (in-flight jobs finish), then every gateway.
    pub async fn shutdown(self) {
        if let Some(scheduler) = self.scheduler {
            scheduler.shutdown().await;
        }
        self.pool.shutdown().await;
        self.services.pipeline.broker().shutdown().await;
        tracing::info!("services stopped");
    }
}

async fn job_backend(config: &Config) -> anyhow::Result<(Arc<dyn JobStore>, Arc<dyn JobQueue>)> {
    if let Some(redis) = &config.redis {
        #[cfg(feature = "redis")]
        {
            let redis = Arc::new(
                recordchain_infra::jobs::RedisJobStore::connect(&redis.url, redis.prefix.clone(), config.jobs.retention)
                    .await
                    .context("failed to connect to redis")?,
            );
            let store: Arc<dyn JobStore> = redis.clone();
            let queue: Arc<dyn JobQueue> = redis;
            return Ok((store, queue));
        }
        #[cfg(not(feature = "redis"))]
        {
            tracing::warn!(prefix = %redis.prefix, "REDIS_URL set but redis feature not enabled, falling back to in-memory");
        }
    }

    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new(config.jobs.retention));
    let queue: Arc<dyn JobQueue> = Arc::new(InMemoryJobQueue::new());
    Ok((store, queue))
}
