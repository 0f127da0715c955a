use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// Job pipeline metrics collector
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    /// In-memory metrics store
    metrics: Arc<Mutex<Metrics>>,
}

/// How a worker finished with one message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcomeKind {
    Cached,
    Duplicate,
    Completed,
    Failed,
    Invalid,
}

/// Metrics data structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Metrics {
    /// Start time of the metrics collection
    pub start_time: DateTime<Utc>,

    /// Messages handled by workers
    pub tasks_received: usize,

    /// Worker outcome counts
    pub outcomes: HashMap<TaskOutcomeKind, usize>,

    /// Orchestrator run durations (task kind -> durations in milliseconds)
    pub task_durations: HashMap<String, Vec<u64>>,

    /// Messages put on the broker
    pub messages_published: usize,

    /// Scheduler ticks that ran
    pub ticks_run: usize,

    /// Scheduler ticks skipped because another tick held the guard
    pub ticks_skipped: usize,

    /// Schedules that failed to dispatch
    pub schedule_errors: usize,

    /// Poll loops that saw a completed job
    pub polls_completed: usize,

    /// Poll loops that ran out of attempts
    pub polls_timed_out: usize,

    /// Completed tasks per minute
    pub completion_rate: Vec<(DateTime<Utc>, usize)>,
}

impl Metrics {
    pub fn outcome_count(&self, outcome: TaskOutcomeKind) -> usize {
        self.outcomes.get(&outcome).copied().unwrap_or(0)
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        let metrics = Metrics {
            start_time: Utc::now(),
            ..Default::default()
        };

        Self {
            metrics: Arc::new(Mutex::new(metrics)),
        }
    }

    /// Record how a worker finished with a message
    pub async fn record_task(&self, kind: &str, outcome: TaskOutcomeKind, duration_ms: Option<u64>) {
        let mut metrics = self.metrics.lock().await;

        metrics.tasks_received += 1;
        *metrics.outcomes.entry(outcome).or_default() += 1;

        if let Some(duration) = duration_ms {
            metrics.task_durations
                .entry(kind.to_string())
                .or_default()
                .push(duration);
        }

        if outcome != TaskOutcomeKind::Completed {
            return;
        }

        // Update completion rate (every minute)
        let now = Utc::now();

        if let Some((last_time, count)) = metrics.completion_rate.last_mut() {
            if (now - *last_time).num_seconds() < 60 {
                *count += 1;
            } else {
                metrics.completion_rate.push((now, 1));
            }
        } else {
            metrics.completion_rate.push((now, 1));
        }
    }

    pub async fn record_published(&self, count: usize) {
        self.metrics.lock().await.messages_published += count;
    }

    /// Record a scheduler tick; `skipped` when the guard was held
    pub async fn record_tick(&self, skipped: bool) {
        let mut metrics = self.metrics.lock().await;
        if skipped {
            metrics.ticks_skipped += 1;
        } else {
            metrics.ticks_run += 1;
        }
    }

    pub async fn record_schedule_error(&self) {
        self.metrics.lock().await.schedule_errors += 1;
    }

    /// Record the end of one poll loop
    pub async fn record_poll(&self, completed: bool) {
        let mut metrics = self.metrics.lock().await;
        if completed {
            metrics.polls_completed += 1;
        } else {
            metrics.polls_timed_out += 1;
        }
    }

    /// Start timing an orchestrator run
    pub fn start_timer(&self) -> RequestTimer {
        RequestTimer {
            start: Instant::now(),
        }
    }

    /// Get all metrics
    pub async fn get_metrics(&self) -> Metrics {
        self.metrics.lock().await.clone()
    }
}

/// Timer for measuring run durations
pub struct RequestTimer {
    /// Start time of the run
    start: Instant,
}

impl RequestTimer {
    /// End timing and get the duration in milliseconds
    pub fn end(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_task_outcomes() {
        let collector = MetricsCollector::new();

        collector.record_task("scrape", TaskOutcomeKind::Completed, Some(120)).await;
        collector.record_task("scrape", TaskOutcomeKind::Duplicate, None).await;
        collector.record_task("seo-analysis", TaskOutcomeKind::Failed, Some(40)).await;

        let metrics = collector.get_metrics().await;
        assert_eq!(metrics.tasks_received, 3);
        assert_eq!(metrics.outcome_count(TaskOutcomeKind::Completed), 1);
        assert_eq!(metrics.outcome_count(TaskOutcomeKind::Duplicate), 1);
        assert_eq!(metrics.outcome_count(TaskOutcomeKind::Cached), 0);
        assert_eq!(metrics.task_durations["scrape"], vec![120]);
        assert_eq!(metrics.completion_rate.len(), 1);
    }

    #[tokio::test]
    async fn test_scheduler_counters() {
        let collector = MetricsCollector::new();

        collector.record_tick(false).await;
        collector.record_tick(true).await;
        collector.record_published(4).await;
        collector.record_poll(true).await;
        collector.record_poll(false).await;

        let metrics = collector.get_metrics().await;
        assert_eq!((metrics.ticks_run, metrics.ticks_skipped), (1, 1));
        assert_eq!(metrics.messages_published, 4);
        assert_eq!((metrics.polls_completed, metrics.polls_timed_out), (1, 1));
    }

    #[test]
    fn test_metrics_serialize_outcome_keys() {
        let mut metrics = Metrics::default();
        metrics.outcomes.insert(TaskOutcomeKind::Cached, 2);

        let value = serde_json::to_value(&metrics).unwrap();
        assert_eq!(value["outcomes"]["cached"], 2);
    }
}
