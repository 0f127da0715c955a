use anyhow::Result;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

use crate::browser::pool::BrowserPool;
use crate::browser::scraper::BrowserScraper;
use crate::cli::config::AppConfig;
use crate::crawler::orchestrator::ScrapeOrchestrator;
use crate::crawler::poller::{HttpStatusClient, StatusSource};
use crate::crawler::probe::SiteProbe;
use crate::crawler::scheduler::RecurringScheduler;
use crate::crawler::task::TaskMessage;
use crate::crawler::worker::Worker;
use crate::server::{self, AppState, StatusFacade};
use crate::storage::cache::{JobStatus, JobStatusCache, MemoryJobCache, RedisJobCache};
use crate::storage::queue::{MemoryTaskBroker, RedisTaskBroker, TaskBroker};
use crate::storage::schedules::ScheduleStore;
use crate::utils::metrics::MetricsCollector;

/// Result of a one-off dispatch
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// A completed result was already cached
    Cached(Value),
    /// The task was put on the queue
    Published(TaskMessage),
}

/// Flips to `true` on Ctrl-C
pub fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
        let _ = tx.send(true);
    });

    rx
}

/// Builds the service components from configuration and runs them
pub struct Controller {
    config: AppConfig,
    broker: Arc<dyn TaskBroker>,
    cache: Arc<dyn JobStatusCache>,
    metrics: MetricsCollector,

    /// Set when the broker is Redis, for in-flight recovery
    redis_broker: Option<Arc<RedisTaskBroker>>,
}

impl Controller {
    /// Connect to the configured broker and job status cache
    pub async fn connect(config: AppConfig) -> Result<Self> {
        let cache: Arc<dyn JobStatusCache> = match config.cache.backend.as_str() {
            "redis" => Arc::new(RedisJobCache::new(&config.cache).await?),
            "memory" => Arc::new(MemoryJobCache::new()),
            other => anyhow::bail!("Unsupported cache backend: {}", other),
        };

        match config.broker.backend.as_str() {
            "redis" => {
                let broker = Arc::new(RedisTaskBroker::new(&config.broker).await?);
                let mut controller = Self::from_parts(config, broker.clone(), cache);
                controller.redis_broker = Some(broker);
                Ok(controller)
            }
            "memory" => {
                info!("Using the in-process task queue; tasks do not leave this process");
                Ok(Self::from_parts(config, Arc::new(MemoryTaskBroker::new()), cache))
            }
            other => anyhow::bail!("Unsupported broker backend: {}", other),
        }
    }

    /// Assemble from existing components
    fn from_parts(config: AppConfig, broker: Arc<dyn TaskBroker>, cache: Arc<dyn JobStatusCache>) -> Self {
        Self {
            config,
            broker,
            cache,
            metrics: MetricsCollector::new(),
            redis_broker: None,
        }
    }

    fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.config.cache.result_ttl)
    }

    fn orchestrator(&self) -> Result<ScrapeOrchestrator> {
        let pool = Arc::new(BrowserPool::new(self.config.browser.clone(), self.config.scrape.user_agent.clone()));
        let scraper = Arc::new(BrowserScraper::new(pool, self.config.scrape.clone())?);
        let probe = SiteProbe::new(&self.config.scrape)?;

        Ok(ScrapeOrchestrator::new(probe, scraper, self.cache.clone(), self.result_ttl()))
    }

    fn status_source(&self) -> Result<Arc<dyn StatusSource>> {
        match &self.config.scheduler.status_base_url {
            Some(base_url) => {
                info!("Polling job status over HTTP at {}", base_url);
                Ok(Arc::new(HttpStatusClient::new(base_url, &self.config.scrape)?))
            }
            None => Ok(Arc::new(StatusFacade::new(self.cache.clone()))),
        }
    }

    /// Consume tasks until shutdown
    pub async fn run_worker(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        if let Some(broker) = &self.redis_broker {
            broker.requeue_inflight().await?;
            info!("{} task(s) waiting in the queue", broker.pending_count().await?);
        }

        let worker = Arc::new(Worker::new(
            self.broker.clone(),
            self.cache.clone(),
            Arc::new(self.orchestrator()?),
            self.metrics.clone(),
            &self.config.worker,
            &self.config.cache,
        ));

        worker.run(shutdown).await
    }

    /// Tick the recurring scheduler until shutdown
    pub async fn run_scheduler(&self, store: Arc<dyn ScheduleStore>, shutdown: watch::Receiver<bool>) -> Result<()> {
        let scheduler = Arc::new(RecurringScheduler::new(
            store,
            self.broker.clone(),
            self.status_source()?,
            self.cache.clone(),
            self.metrics.clone(),
            self.config.scheduler.clone(),
            self.result_ttl(),
        ));

        scheduler.run(shutdown).await
    }

    /// Serve the status endpoints until shutdown
    pub async fn serve(&self, store: Arc<dyn ScheduleStore>, shutdown: watch::Receiver<bool>) -> Result<()> {
        let state = AppState {
            facade: StatusFacade::new(self.cache.clone()),
            store,
            metrics: self.metrics.clone(),
        };

        server::serve(state, &self.config.server.bind, shutdown).await
    }

    /// Worker, scheduler and status service in one process
    pub async fn run_all(&self, store: Arc<dyn ScheduleStore>, shutdown: watch::Receiver<bool>) -> Result<()> {
        tokio::try_join!(
            self.run_worker(shutdown.clone()),
            self.run_scheduler(store.clone(), shutdown.clone()),
            self.serve(store, shutdown),
        )?;

        Ok(())
    }

    /// Queue one task unless a completed result is already cached
    pub async fn dispatch(&self, message: TaskMessage) -> Result<DispatchOutcome> {
        message.validate()?;

        let cached = self.cache.get(&message.task_key()).await?;
        if let Some(result) = cached.as_ref().and_then(JobStatus::result) {
            info!("{} already completed, not queueing", message.task_key());
            return Ok(DispatchOutcome::Cached(result.clone()));
        }

        self.broker.publish(&message).await?;
        self.metrics.record_published(1).await;
        info!("Queued {} for {}", message.kind, message.url);

        Ok(DispatchOutcome::Published(message))
    }

    /// Current state of a job
    pub async fn status(&self, message: &TaskMessage) -> Result<Option<JobStatus>> {
        message.validate()?;
        self.cache.get(&message.task_key()).await
    }
}
