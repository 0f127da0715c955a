use anyhow::{Result, Context};
use async_trait::async_trait;
use redis::{Client, aio::MultiplexedConnection};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info};

use crate::cli::config::BrokerSettings;
use crate::crawler::task::{TaskEnvelope, TaskMessage};

/// A received message that still has to be acknowledged
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Decoded task
    pub message: TaskMessage,

    /// Payload exactly as it sits in the in-flight list
    raw: String,
}

/// Fire-and-forget task channel with at-least-once delivery.
///
/// No ordering or exactly-once guarantee: a message received but never
/// acknowledged may be delivered again.
#[async_trait]
pub trait TaskBroker: Send + Sync {
    /// Enqueue a task
    async fn publish(&self, message: &TaskMessage) -> Result<()>;

    /// Wait up to `timeout` for the next task
    async fn receive(&self, timeout: Duration) -> Result<Option<Delivery>>;

    /// Confirm a delivery so it is not redelivered
    async fn ack(&self, delivery: &Delivery) -> Result<()>;
}

fn encode(message: &TaskMessage) -> Result<String> {
    serde_json::to_string(&message.to_envelope())
        .context("Failed to serialize task")
}

fn decode(raw: &str) -> Result<TaskMessage> {
    let envelope: TaskEnvelope = serde_json::from_str(raw)
        .context("Failed to deserialize task")?;
    Ok(envelope.into())
}

/// Redis list broker: `LPUSH` to publish, `BRPOPLPUSH` into an in-flight
/// list to receive, `LREM` from the in-flight list to acknowledge
pub struct RedisTaskBroker {
    /// Queue key
    queue_key: String,

    /// In-flight key
    inflight_key: String,

    /// Connection for publish/ack
    conn_pool: Arc<Mutex<MultiplexedConnection>>,

    /// Dedicated connection for blocking receives
    blocking_conn: Mutex<MultiplexedConnection>,
}

impl RedisTaskBroker {
    /// Create a new broker
    pub async fn new(config: &BrokerSettings) -> Result<Self> {
        let client = Client::open(config.redis_url.clone())
            .context(format!("Failed to connect to Redis at {}", config.redis_url))?;

        let conn = client.get_multiplexed_async_connection().await
            .context("Failed to get Redis connection")?;
        let blocking_conn = client.get_multiplexed_async_connection().await
            .context("Failed to get Redis connection")?;

        Ok(Self {
            queue_key: format!("{}:queue", config.queue_prefix),
            inflight_key: format!("{}:inflight", config.queue_prefix),
            conn_pool: Arc::new(Mutex::new(conn)),
            blocking_conn: Mutex::new(blocking_conn),
        })
    }

    /// Move messages orphaned in the in-flight list back onto the queue
    pub async fn requeue_inflight(&self) -> Result<usize> {
        let mut conn = self.conn_pool.lock().await;
        let mut moved = 0;

        loop {
            let raw: Option<String> = redis::cmd("RPOPLPUSH")
                .arg(&self.inflight_key)
                .arg(&self.queue_key)
                .query_async(&mut *conn)
                .await
                .context("Failed to requeue in-flight task")?;

            if raw.is_none() {
                break;
            }
            moved += 1;
        }

        if moved > 0 {
            info!("Requeued {} in-flight tasks", moved);
        }

        Ok(moved)
    }

    async fn remove_inflight(&self, raw: &str) -> Result<()> {
        let mut conn = self.conn_pool.lock().await;

        redis::cmd("LREM")
            .arg(&self.inflight_key)
            .arg(1)
            .arg(raw)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to acknowledge task")?;

        Ok(())
    }

    /// Get the number of pending tasks
    pub async fn pending_count(&self) -> Result<usize> {
        let mut conn = self.conn_pool.lock().await;

        let count: usize = redis::cmd("LLEN")
            .arg(&self.queue_key)
            .query_async(&mut *conn)
            .await
            .context("Failed to get queue length")?;

        Ok(count)
    }
}

#[async_trait]
impl TaskBroker for RedisTaskBroker {
    async fn publish(&self, message: &TaskMessage) -> Result<()> {
        let raw = encode(message)?;

        let mut conn = self.conn_pool.lock().await;

        redis::cmd("LPUSH")
            .arg(&self.queue_key)
            .arg(&raw)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to push task to Redis queue")?;

        debug!("Published {} task for {}", message.kind, message.url);

        Ok(())
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<Delivery>> {
        let raw: Option<String> = {
            let mut conn = self.blocking_conn.lock().await;
            redis::cmd("BRPOPLPUSH")
                .arg(&self.queue_key)
                .arg(&self.inflight_key)
                .arg(timeout.as_secs().max(1))
                .query_async(&mut *conn)
                .await
                .context("Failed to pop task from Redis queue")?
        };

        let Some(raw) = raw else {
            return Ok(None);
        };

        match decode(&raw) {
            Ok(message) => Ok(Some(Delivery { message, raw })),
            Err(e) => {
                // Undecodable payloads are dropped rather than redelivered forever
                error!("Dropping malformed task payload: {:#}", e);
                self.remove_inflight(&raw).await?;
                Ok(None)
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.remove_inflight(&delivery.raw).await
    }
}

/// In-process broker for single-process runs and tests
#[derive(Default)]
pub struct MemoryTaskBroker {
    queue: Mutex<VecDeque<String>>,
    inflight: Mutex<Vec<String>>,
    #[cfg(test)]
    published: Mutex<Vec<TaskMessage>>,
    notify: Notify,
}

impl MemoryTaskBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message published so far, in order
    #[cfg(test)]
    pub async fn published(&self) -> Vec<TaskMessage> {
        self.published.lock().await.clone()
    }

    /// Deliveries received but not yet acknowledged
    #[cfg(test)]
    pub async fn inflight_count(&self) -> usize {
        self.inflight.lock().await.len()
    }

    /// Put a raw payload on the queue, as a redelivery or a foreign producer would
    pub async fn push_raw(&self, raw: impl Into<String>) {
        self.queue.lock().await.push_back(raw.into());
        self.notify.notify_one();
    }
}

#[async_trait]
impl TaskBroker for MemoryTaskBroker {
    async fn publish(&self, message: &TaskMessage) -> Result<()> {
        let raw = encode(message)?;
        #[cfg(test)]
        self.published.lock().await.push(message.clone());
        self.push_raw(raw).await;
        Ok(())
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<Delivery>> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let next = self.queue.lock().await.pop_front();

            if let Some(raw) = next {
                match decode(&raw) {
                    Ok(message) => {
                        self.inflight.lock().await.push(raw.clone());
                        return Ok(Some(Delivery { message, raw }));
                    }
                    Err(e) => {
                        error!("Dropping malformed task payload: {:#}", e);
                        continue;
                    }
                }
            }

            if tokio::time::timeout_at(deadline, self.notify.notified()).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut inflight = self.inflight.lock().await;
        if let Some(pos) = inflight.iter().position(|raw| *raw == delivery.raw) {
            inflight.remove(pos);
        }
        Ok(())
    }
}
