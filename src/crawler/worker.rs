use anyhow::{Result, Context};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

use crate::cli::config::{CacheSettings, WorkerSettings};
use crate::crawler::orchestrator::ScrapeOrchestrator;
use crate::crawler::task::TaskMessage;
use crate::storage::cache::{JobStatus, JobStatusCache};
use crate::storage::queue::{Delivery, TaskBroker};
use crate::utils::metrics::{MetricsCollector, TaskOutcomeKind};

/// Executes a task once the worker has claimed it
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, message: &TaskMessage) -> Result<Value>;
}

#[async_trait]
impl TaskRunner for ScrapeOrchestrator {
    async fn run(&self, message: &TaskMessage) -> Result<Value> {
        self.execute(message).await
    }
}

/// What happened to one delivery
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome {
    /// A completed result already existed; `age` is time since completion
    Cached { result: Value, age: chrono::Duration },

    /// Another run holds the key
    Duplicate,

    Completed(Value),

    Failed(String),

    /// Rejected before touching the cache
    Invalid(String),
}

impl WorkerOutcome {
    fn kind(&self) -> TaskOutcomeKind {
        match self {
            WorkerOutcome::Cached { .. } => TaskOutcomeKind::Cached,
            WorkerOutcome::Duplicate => TaskOutcomeKind::Duplicate,
            WorkerOutcome::Completed(_) => TaskOutcomeKind::Completed,
            WorkerOutcome::Failed(_) => TaskOutcomeKind::Failed,
            WorkerOutcome::Invalid(_) => TaskOutcomeKind::Invalid,
        }
    }
}

/// Consumes task messages and records their job status
pub struct Worker {
    broker: Arc<dyn TaskBroker>,
    cache: Arc<dyn JobStatusCache>,
    runner: Arc<dyn TaskRunner>,
    metrics: MetricsCollector,
    max_concurrent: usize,
    receive_timeout: Duration,
    processing_ttl: Duration,
    result_ttl: Duration,
    permits: Arc<Semaphore>,
}

impl Worker {
    pub fn new(
        broker: Arc<dyn TaskBroker>,
        cache: Arc<dyn JobStatusCache>,
        runner: Arc<dyn TaskRunner>,
        metrics: MetricsCollector,
        worker: &WorkerSettings,
        ttls: &CacheSettings,
    ) -> Self {
        let max_concurrent = worker.max_concurrent_tasks.max(1);

        Self {
            broker,
            cache,
            runner,
            metrics,
            max_concurrent,
            receive_timeout: Duration::from_secs(worker.receive_timeout.max(1)),
            processing_ttl: Duration::from_secs(ttls.processing_ttl),
            result_ttl: Duration::from_secs(ttls.result_ttl),
            permits: Arc::new(Semaphore::new(max_concurrent)),
        }
    }

    /// Receive and handle messages until `shutdown` flips or its sender goes away.
    ///
    /// At most `max_concurrent_tasks` messages are handled at once. In-flight
    /// handlers are awaited before returning.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("Worker started with {} slots", self.max_concurrent);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = self.permits.clone().acquire_owned() => permit.context("Worker semaphore closed")?,
                _ = shutdown.changed() => break,
            };

            let delivery = tokio::select! {
                received = self.broker.receive(self.receive_timeout) => match received {
                    Ok(Some(delivery)) => delivery,
                    Ok(None) => continue,
                    Err(e) => {
                        error!("Failed to receive task: {:#}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                },
                _ = shutdown.changed() => break,
            };

            let worker = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = worker.handle(delivery).await {
                    error!("Task handling failed: {:#}", e);
                }
            });
        }

        info!("Worker stopping, waiting for in-flight tasks");
        let _drained = self.permits
            .acquire_many(self.max_concurrent as u32)
            .await
            .context("Worker semaphore closed")?;
        info!("Worker stopped");

        Ok(())
    }

    /// Take one delivery through the dedup gate and, if it wins, the orchestrator
    pub async fn handle(&self, delivery: Delivery) -> Result<WorkerOutcome> {
        let message = &delivery.message;

        if let Err(e) = message.validate() {
            warn!("Dropping invalid {} task for '{}': {}", message.kind, message.url, e);
            self.broker.ack(&delivery).await?;
            return self.finish(message, WorkerOutcome::Invalid(e.to_string()), None).await;
        }

        let key = message.task_key();

        match self.cache.get(&key).await? {
            Some(JobStatus::Completed { result, completed_at }) => {
                let age = Utc::now() - completed_at;
                debug!("{} already completed {}s ago", key, age.num_seconds());
                self.broker.ack(&delivery).await?;
                return self.finish(message, WorkerOutcome::Cached { result, age }, None).await;
            }
            Some(JobStatus::Processing { .. }) => {
                debug!("{} already in flight, dropping duplicate", key);
                self.broker.ack(&delivery).await?;
                return self.finish(message, WorkerOutcome::Duplicate, None).await;
            }
            _ => {}
        }

        let holder = message.id.to_string();
        if !self.cache.try_acquire_lease(&key, &holder, self.processing_ttl).await? {
            debug!("Lost lease race for {}, dropping duplicate", key);
            self.broker.ack(&delivery).await?;
            return self.finish(message, WorkerOutcome::Duplicate, None).await;
        }

        let timer = self.metrics.start_timer();
        let outcome = self.process(&delivery, &key).await;

        match self.cache.release_lease(&key, &holder).await {
            Ok(true) => {}
            Ok(false) => warn!("Lease on {} lapsed before the task finished", key),
            Err(e) => error!("Failed to release lease on {}: {:#}", key, e),
        }

        self.finish(message, outcome?, Some(timer.end())).await
    }

    /// Runs while holding the lease
    async fn process(&self, delivery: &Delivery, key: &str) -> Result<WorkerOutcome> {
        let message = &delivery.message;

        self.cache.set(key, &JobStatus::processing(), self.processing_ttl).await?;
        self.broker.ack(delivery).await?;

        info!("Running {} for {}", message.kind, message.url);

        match self.runner.run(message).await {
            Ok(result) => {
                self.cache.set(key, &JobStatus::completed(result.clone()), self.result_ttl).await?;
                info!("Completed {}", key);
                Ok(WorkerOutcome::Completed(result))
            }
            Err(e) => {
                let reason = format!("{:#}", e);
                error!("Task {} failed: {}", key, reason);
                self.cache.set(key, &JobStatus::failed(reason.clone()), self.result_ttl).await?;
                Ok(WorkerOutcome::Failed(reason))
            }
        }
    }

    async fn finish(&self, message: &TaskMessage, outcome: WorkerOutcome, duration_ms: Option<u64>) -> Result<WorkerOutcome> {
        self.metrics.record_task(message.kind.as_str(), outcome.kind(), duration_ms).await;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::task::TaskKind;
    use crate::storage::cache::MemoryJobCache;
    use crate::storage::queue::MemoryTaskBroker;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Harness {
        broker: Arc<MemoryTaskBroker>,
        cache: Arc<MemoryJobCache>,
        metrics: MetricsCollector,
        worker: Arc<Worker>,
    }

    fn harness(runner: Arc<dyn TaskRunner>) -> Harness {
        let broker = Arc::new(MemoryTaskBroker::new());
        let cache = Arc::new(MemoryJobCache::new());
        let metrics = MetricsCollector::new();
        let worker = Arc::new(Worker::new(
            broker.clone(),
            cache.clone(),
            runner,
            metrics.clone(),
            &WorkerSettings { max_concurrent_tasks: 2, receive_timeout: 1 },
            &CacheSettings::default(),
        ));

        Harness { broker, cache, metrics, worker }
    }

    async fn deliver(broker: &MemoryTaskBroker, message: &TaskMessage) -> Delivery {
        broker.publish(message).await.unwrap();
        broker.receive(Duration::from_millis(10)).await.unwrap().unwrap()
    }

    /// Counts runs and takes a while over each
    struct SlowRunner {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl TaskRunner for SlowRunner {
        async fn run(&self, message: &TaskMessage) -> Result<Value> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(json!({ "url": message.url }))
        }
    }

    #[tokio::test]
    async fn test_processing_record_blocks_second_run() {
        let mut runner = MockTaskRunner::new();
        runner.expect_run().never();
        let h = harness(Arc::new(runner));

        let message = TaskMessage::new(TaskKind::ScrapeImages, "https://acme.test");
        h.cache.set(&message.task_key(), &JobStatus::processing(), Duration::from_secs(60)).await.unwrap();

        let delivery = deliver(&h.broker, &message).await;
        let outcome = h.worker.handle(delivery).await.unwrap();

        assert_eq!(outcome, WorkerOutcome::Duplicate);
        assert_eq!(h.broker.inflight_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_deliveries_run_once() {
        let runner = Arc::new(SlowRunner { runs: AtomicUsize::new(0) });
        let h = harness(runner.clone());

        let message = TaskMessage::new(TaskKind::Scrape, "https://acme.test");
        let redelivered = TaskMessage::new(TaskKind::Scrape, "https://acme.test");
        let first = deliver(&h.broker, &message).await;
        let second = deliver(&h.broker, &redelivered).await;

        let (a, b) = tokio::join!(h.worker.handle(first), h.worker.handle(second));
        let outcomes = [a.unwrap(), b.unwrap()];

        assert_eq!(runner.runs.load(Ordering::SeqCst), 1);
        assert_eq!(outcomes.iter().filter(|o| **o == WorkerOutcome::Duplicate).count(), 1);
        assert!(outcomes.iter().any(|o| matches!(o, WorkerOutcome::Completed(_))));
    }

    #[tokio::test]
    async fn test_success_records_completed_and_releases_lease() {
        let mut runner = MockTaskRunner::new();
        runner.expect_run().times(1).returning(|_| Ok(json!({ "images": ["a.jpg"] })));
        let h = harness(Arc::new(runner));

        let message = TaskMessage::new(TaskKind::ScrapeImages, "https://acme.test");
        let delivery = deliver(&h.broker, &message).await;
        let outcome = h.worker.handle(delivery).await.unwrap();

        assert_eq!(outcome, WorkerOutcome::Completed(json!({ "images": ["a.jpg"] })));

        let stored = h.cache.get("https://acme.test-scrape-images").await.unwrap().unwrap();
        assert_eq!(stored.result(), Some(&json!({ "images": ["a.jpg"] })));
        assert!(h.cache.try_acquire_lease("https://acme.test-scrape-images", "next", Duration::from_secs(5)).await.unwrap());

        let metrics = h.metrics.get_metrics().await;
        assert_eq!(metrics.outcome_count(TaskOutcomeKind::Completed), 1);
        assert_eq!(metrics.task_durations["scrape-images"].len(), 1);
    }

    /// Outlives the processing lease, during which a redelivery claims the key
    struct OverrunRunner {
        cache: Arc<MemoryJobCache>,
    }

    #[async_trait]
    impl TaskRunner for OverrunRunner {
        async fn run(&self, message: &TaskMessage) -> Result<Value> {
            tokio::time::sleep(Duration::from_secs(301)).await;
            let claimed = self.cache
                .try_acquire_lease(&message.task_key(), "redelivery", Duration::from_secs(300))
                .await?;
            assert!(claimed);
            Ok(json!({ "url": message.url }))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrun_does_not_release_someone_elses_lease() {
        let cache = Arc::new(MemoryJobCache::new());
        let broker = Arc::new(MemoryTaskBroker::new());
        let worker = Worker::new(
            broker.clone(),
            cache.clone(),
            Arc::new(OverrunRunner { cache: cache.clone() }),
            MetricsCollector::new(),
            &WorkerSettings { max_concurrent_tasks: 1, receive_timeout: 1 },
            &CacheSettings { processing_ttl: 300, ..CacheSettings::default() },
        );

        let message = TaskMessage::new(TaskKind::Scrape, "https://acme.test");
        let delivery = deliver(&broker, &message).await;
        assert!(matches!(worker.handle(delivery).await.unwrap(), WorkerOutcome::Completed(_)));

        // The redelivery still owns the key
        assert!(!cache.try_acquire_lease(&message.task_key(), "third", Duration::from_secs(300)).await.unwrap());
        assert!(cache.release_lease(&message.task_key(), "redelivery").await.unwrap());
    }

    #[tokio::test]
    async fn test_failure_records_error_without_retry() {
        let mut runner = MockTaskRunner::new();
        runner.expect_run().times(1).returning(|_| Err(anyhow::anyhow!("browser crashed")));
        let h = harness(Arc::new(runner));

        let message = TaskMessage::new(TaskKind::Screenshot, "https://acme.test");
        let delivery = deliver(&h.broker, &message).await;
        let outcome = h.worker.handle(delivery).await.unwrap();

        assert_eq!(outcome, WorkerOutcome::Failed("browser crashed".to_string()));

        let stored = h.cache.get(&message.task_key()).await.unwrap().unwrap();
        assert_eq!(stored.name(), "error");
        assert!(h.broker.published().await.len() == 1);
    }

    #[tokio::test]
    async fn test_completed_result_is_served_from_cache() {
        let mut runner = MockTaskRunner::new();
        runner.expect_run().never();
        let h = harness(Arc::new(runner));

        let message = TaskMessage::keyword("https://acme.test", "tea");
        h.cache.set(&message.task_key(), &JobStatus::completed(json!({ "occurrences": 3 })), Duration::from_secs(60))
            .await
            .unwrap();

        let delivery = deliver(&h.broker, &message).await;
        match h.worker.handle(delivery).await.unwrap() {
            WorkerOutcome::Cached { result, age } => {
                assert_eq!(result, json!({ "occurrences": 3 }));
                assert!(age >= chrono::Duration::zero());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_message_is_acked_and_skipped() {
        let mut runner = MockTaskRunner::new();
        runner.expect_run().never();
        let h = harness(Arc::new(runner));

        let message = TaskMessage::new(TaskKind::Scrape, "not a url");
        let delivery = deliver(&h.broker, &message).await;
        let outcome = h.worker.handle(delivery).await.unwrap();

        assert!(matches!(outcome, WorkerOutcome::Invalid(_)));
        assert_eq!(h.broker.inflight_count().await, 0);
        assert!(h.cache.get(&message.task_key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_run_loop_drains_queue_and_stops() {
        let runner = Arc::new(SlowRunner { runs: AtomicUsize::new(0) });
        let h = harness(runner.clone());

        for url in ["https://a.test", "https://b.test", "https://c.test"] {
            h.broker.publish(&TaskMessage::new(TaskKind::ScrapeLogo, url)).await.unwrap();
        }

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(h.worker.clone().run(rx));

        for _ in 0..100 {
            if h.metrics.get_metrics().await.tasks_received == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(runner.runs.load(Ordering::SeqCst), 3);
        assert_eq!(h.broker.inflight_count().await, 0);
        for url in ["https://a.test", "https://b.test", "https://c.test"] {
            let key = format!("{}-scrape-logo", url);
            assert_eq!(h.cache.get(&key).await.unwrap().unwrap().name(), "completed");
        }
    }
}
