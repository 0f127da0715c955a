use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Months, Utc};
use futures::stream::{self, StreamExt};
use serde::{Serialize, Deserialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cli::config::SchedulerSettings;
use crate::crawler::poller::{PollTarget, StatusSource};
use crate::crawler::task::{TaskKind, TaskMessage};
use crate::storage::cache::{JobStatus, JobStatusCache};
use crate::storage::queue::TaskBroker;
use crate::storage::schedules::{HistoryEntry, Schedule, ScheduleStore};
use crate::utils::metrics::MetricsCollector;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Unknown frequency: '{0}'")]
    UnknownFrequency(String),

    #[error("Next run after {0} is out of range")]
    OutOfRange(DateTime<Utc>),
}

/// How often a schedule repeats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Frequency {
    Daily,
    Weekly,
    BiWeekly,
    Monthly,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::BiWeekly => "bi-weekly",
            Frequency::Monthly => "monthly",
        }
    }

    /// The run after `from`. Monthly keeps the day of month, clamped to the
    /// month's last day.
    pub fn advance(&self, from: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        let next = match self {
            Frequency::Daily => from.checked_add_signed(ChronoDuration::days(1)),
            Frequency::Weekly => from.checked_add_signed(ChronoDuration::days(7)),
            Frequency::BiWeekly => from.checked_add_signed(ChronoDuration::days(14)),
            Frequency::Monthly => from.checked_add_months(Months::new(1)),
        };

        next.ok_or(ScheduleError::OutOfRange(from))
    }

    /// First run on the cadence of `from` that lies after `now`. Missed
    /// periods are skipped rather than replayed.
    pub fn next_after(&self, from: DateTime<Utc>, now: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        let mut next = self.advance(from)?;
        while next <= now {
            next = self.advance(next)?;
        }
        Ok(next)
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Frequency {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(Frequency::Daily),
            "weekly" => Ok(Frequency::Weekly),
            "bi-weekly" => Ok(Frequency::BiWeekly),
            "monthly" => Ok(Frequency::Monthly),
            _ => Err(ScheduleError::UnknownFrequency(s.to_string())),
        }
    }
}

/// What a tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickReport {
    /// Another tick held the guard
    Skipped,
    Ran { due: usize, dispatched: usize, failed: usize },
}

/// How waiting on one job ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Completed,
    /// Attempts ran out before the job completed
    TimedOut,
}

/// One schedule's dispatch within a tick
#[derive(Debug, Clone)]
pub struct ScheduleRun {
    pub schedule_id: Uuid,
    pub next_run_at: DateTime<Utc>,
    pub published: Vec<TaskMessage>,
    pub polls: Vec<(PollTarget, PollOutcome)>,
}

/// Periodically publishes due schedules and records their results
pub struct RecurringScheduler {
    store: Arc<dyn ScheduleStore>,
    broker: Arc<dyn TaskBroker>,
    status: Arc<dyn StatusSource>,
    cache: Arc<dyn JobStatusCache>,
    metrics: MetricsCollector,
    config: SchedulerSettings,
    result_ttl: Duration,
    tick_guard: Mutex<()>,
}

impl RecurringScheduler {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        broker: Arc<dyn TaskBroker>,
        status: Arc<dyn StatusSource>,
        cache: Arc<dyn JobStatusCache>,
        metrics: MetricsCollector,
        config: SchedulerSettings,
        result_ttl: Duration,
    ) -> Self {
        Self {
            store,
            broker,
            status,
            cache,
            metrics,
            config,
            result_ttl,
            tick_guard: Mutex::new(()),
        }
    }

    /// Tick every `tick_interval` seconds until `shutdown` flips or its sender goes away.
    ///
    /// Ticks are spawned, so a slow tick does not delay the timer; an
    /// overlapping tick is skipped by the guard. Running ticks are awaited
    /// before returning.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.tick_interval.max(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Scheduler started, ticking every {}s", self.config.tick_interval.max(1));

        let mut ticks = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = interval.tick() => {
                    let scheduler = self.clone();
                    ticks.spawn(async move {
                        if let Err(e) = scheduler.tick().await {
                            error!("Scheduler tick failed: {:#}", e);
                        }
                    });
                }
                Some(finished) = ticks.join_next(), if !ticks.is_empty() => {
                    if let Err(e) = finished {
                        error!("Scheduler tick panicked: {}", e);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        if !ticks.is_empty() {
            info!("Scheduler stopping, waiting for {} running tick(s)", ticks.len());
        }
        while let Some(finished) = ticks.join_next().await {
            if let Err(e) = finished {
                error!("Scheduler tick panicked: {}", e);
            }
        }

        info!("Scheduler stopped");
        Ok(())
    }

    /// Dispatch every due schedule
    pub async fn tick(&self) -> Result<TickReport> {
        let Ok(_guard) = self.tick_guard.try_lock() else {
            info!("Previous tick still running, skipping");
            self.metrics.record_tick(true).await;
            return Ok(TickReport::Skipped);
        };
        self.metrics.record_tick(false).await;

        let due = self.store.due_schedules(Utc::now()).await?;
        if due.is_empty() {
            debug!("No schedules due");
            return Ok(TickReport::Ran { due: 0, dispatched: 0, failed: 0 });
        }

        let total = due.len();
        info!("{} schedule(s) due", total);

        let results: Vec<(Uuid, Result<ScheduleRun>)> = stream::iter(due)
            .map(|schedule| async move {
                let id = schedule.id;
                (id, self.run_schedule(schedule).await)
            })
            .buffer_unordered(self.config.schedule_concurrency.max(1))
            .collect()
            .await;

        let mut failed = 0;
        for (id, result) in &results {
            match result {
                Ok(run) => {
                    let completed = run.polls.iter().filter(|(_, outcome)| *outcome == PollOutcome::Completed).count();
                    info!(
                        "Schedule {}: {}/{} result(s) recorded, next run at {}",
                        run.schedule_id, completed, run.published.len(), run.next_run_at
                    );
                }
                Err(e) => {
                    error!("Schedule {} failed: {:#}", id, e);
                    self.metrics.record_schedule_error().await;
                    failed += 1;
                }
            }
        }

        Ok(TickReport::Ran { due: total, dispatched: total - failed, failed })
    }

    /// Publish one schedule's tasks, advance it, then wait for the results.
    ///
    /// The frequency is checked before anything is published, so a bad
    /// frequency leaves the schedule and the queue untouched.
    pub async fn run_schedule(&self, schedule: Schedule) -> Result<ScheduleRun> {
        let frequency: Frequency = schedule.frequency.parse()?;
        let next_run_at = frequency.next_after(schedule.next_run_at, Utc::now())?;

        let mut published = vec![TaskMessage::new(TaskKind::Scrape, schedule.url.clone())];
        published.extend(schedule.keywords.iter().map(|kw| TaskMessage::keyword(schedule.url.clone(), kw.clone())));

        for message in &published {
            self.broker.publish(message).await?;
        }
        self.metrics.record_published(published.len()).await;

        let targets: Vec<PollTarget> = published.iter().map(PollTarget::for_message).collect();

        self.store.update_next_run(schedule.id, next_run_at).await?;
        info!("Dispatched {} task(s) for {}, next run at {}", published.len(), schedule.url, next_run_at);

        let outcomes = futures::future::join_all(targets.iter().map(|target| self.poll(schedule.id, target))).await;

        Ok(ScheduleRun {
            schedule_id: schedule.id,
            next_run_at,
            published,
            polls: targets.into_iter().zip(outcomes).collect(),
        })
    }

    /// Read the job until it completes or attempts run out
    async fn poll(&self, schedule_id: Uuid, target: &PollTarget) -> PollOutcome {
        let delay = Duration::from_millis(self.config.poll_delay_ms);
        let attempts = self.config.poll_attempts;

        for attempt in 1..=attempts {
            match self.status.fetch(target).await {
                Ok(Some(JobStatus::Completed { result, .. })) => {
                    self.record_result(schedule_id, target, result).await;
                    self.metrics.record_poll(true).await;
                    return PollOutcome::Completed;
                }
                Ok(status) => {
                    debug!("Attempt {} for {}: {}", attempt, target.cache_key(), status.as_ref().map_or("missing", |s| s.name()));
                }
                Err(e) => {
                    warn!("Attempt {} for {} failed: {:#}", attempt, target.cache_key(), e);
                }
            }

            if attempt < attempts {
                tokio::time::sleep(delay).await;
            }
        }

        warn!("Gave up on {} after {} attempts", target.cache_key(), attempts);
        self.metrics.record_poll(false).await;

        if self.config.mark_poll_timeouts {
            self.mark_timed_out(&target.cache_key()).await;
        }

        PollOutcome::TimedOut
    }

    /// Record a timeout unless the job already reached a terminal state
    async fn mark_timed_out(&self, key: &str) {
        match self.cache.get(key).await {
            Ok(Some(status)) if status.is_terminal() => {
                debug!("{} is {} already, not marking it timed out", key, status.name());
            }
            Ok(_) => {
                if let Err(e) = self.cache.set(key, &JobStatus::failed("poll timeout"), self.result_ttl).await {
                    error!("Failed to mark {} as timed out: {:#}", key, e);
                }
            }
            Err(e) => error!("Failed to read {} before marking it timed out: {:#}", key, e),
        }
    }

    async fn record_result(&self, schedule_id: Uuid, target: &PollTarget, result: Value) {
        let entry = HistoryEntry::now(result);

        let stored = match target {
            PollTarget::Scrape { .. } => self.store.append_history(schedule_id, entry).await,
            PollTarget::Keyword { keyword, .. } => {
                self.store.append_keyword_history(schedule_id, keyword, entry).await
            }
        };

        match stored {
            Ok(()) => debug!("Recorded result for {}", target.cache_key()),
            Err(e) => error!("Failed to record result for {}: {:#}", target.cache_key(), e),
        }
    }
}
