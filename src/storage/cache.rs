use anyhow::{Result, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{Client, aio::MultiplexedConnection};
use serde::{Serialize, Deserialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::cli::config::CacheSettings;

/// Processing state of one job, keyed by its task key.
///
/// Serialized as `{"status": "processing" | "completed" | "error", ...}`.
/// `Completed` and `Failed` are terminal; only a new task for the same key
/// replaces them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum JobStatus {
    Processing {
        started_at: DateTime<Utc>,
    },
    Completed {
        result: Value,
        completed_at: DateTime<Utc>,
    },
    #[serde(rename = "error")]
    Failed {
        reason: String,
        failed_at: DateTime<Utc>,
    },
}

impl JobStatus {
    pub fn processing() -> Self {
        JobStatus::Processing { started_at: Utc::now() }
    }

    pub fn completed(result: Value) -> Self {
        JobStatus::Completed { result, completed_at: Utc::now() }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        JobStatus::Failed { reason: reason.into(), failed_at: Utc::now() }
    }

    /// Wire name of the state
    pub fn name(&self) -> &'static str {
        match self {
            JobStatus::Processing { .. } => "processing",
            JobStatus::Completed { .. } => "completed",
            JobStatus::Failed { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Processing { .. })
    }

    pub fn result(&self) -> Option<&Value> {
        match self {
            JobStatus::Completed { result, .. } => Some(result),
            _ => None,
        }
    }
}

/// Shared store of job states.
///
/// `get`/`set` give no compare-and-swap; check-then-set through them is
/// best effort. Use the lease to claim a key exclusively.
#[async_trait]
pub trait JobStatusCache: Send + Sync {
    /// Read a job state
    async fn get(&self, key: &str) -> Result<Option<JobStatus>>;

    /// Write a job state that expires after `ttl`
    async fn set(&self, key: &str, status: &JobStatus, ttl: Duration) -> Result<()>;

    /// Claim the key for `holder` unless someone else holds it
    async fn try_acquire_lease(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Drop the claim on the key if `holder` still owns it. Returns false
    /// when the lease had lapsed or passed to someone else.
    async fn release_lease(&self, key: &str, holder: &str) -> Result<bool>;
}

/// Deletes the lease only while it still names the caller
const RELEASE_LEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

fn lease_key(key: &str) -> String {
    format!("lease:{}", key)
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

/// Redis-backed job status cache
pub struct RedisJobCache {
    /// Connection pool
    conn_pool: Arc<Mutex<MultiplexedConnection>>,
}

impl RedisJobCache {
    /// Connect to the cache
    pub async fn new(config: &CacheSettings) -> Result<Self> {
        let client = Client::open(config.redis_url.clone())
            .context(format!("Failed to connect to Redis at {}", config.redis_url))?;

        let conn = client.get_multiplexed_async_connection().await
            .context("Failed to get Redis connection")?;

        Ok(Self {
            conn_pool: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl JobStatusCache for RedisJobCache {
    async fn get(&self, key: &str) -> Result<Option<JobStatus>> {
        let mut conn = self.conn_pool.lock().await;

        let raw: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut *conn)
            .await
            .context(format!("Failed to read job status for {}", key))?;

        match raw {
            Some(raw) => {
                let status = serde_json::from_str(&raw)
                    .context(format!("Malformed job status for {}", key))?;
                Ok(Some(status))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, status: &JobStatus, ttl: Duration) -> Result<()> {
        let raw = serde_json::to_string(status)
            .context("Failed to serialize job status")?;

        let mut conn = self.conn_pool.lock().await;

        redis::cmd("SET")
            .arg(key)
            .arg(raw)
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async::<_, ()>(&mut *conn)
            .await
            .context(format!("Failed to write job status for {}", key))?;

        debug!("Stored job status {} for {}", status.name(), key);

        Ok(())
    }

    async fn try_acquire_lease(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn_pool.lock().await;

        let reply: Option<String> = redis::cmd("SET")
            .arg(lease_key(key))
            .arg(holder)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut *conn)
            .await
            .context(format!("Failed to acquire lease for {}", key))?;

        Ok(reply.is_some())
    }

    async fn release_lease(&self, key: &str, holder: &str) -> Result<bool> {
        let mut conn = self.conn_pool.lock().await;

        let deleted: i64 = redis::cmd("EVAL")
            .arg(RELEASE_LEASE_SCRIPT)
            .arg(1)
            .arg(lease_key(key))
            .arg(holder)
            .query_async(&mut *conn)
            .await
            .context(format!("Failed to release lease for {}", key))?;

        Ok(deleted > 0)
    }
}

/// In-process cache for standalone runs and tests
#[derive(Default)]
pub struct MemoryJobCache {
    entries: Mutex<HashMap<String, (JobStatus, Instant)>>,
    leases: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryJobCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStatusCache for MemoryJobCache {
    async fn get(&self, key: &str) -> Result<Option<JobStatus>> {
        let mut entries = self.entries.lock().await;

        match entries.get(key) {
            Some((_, expires_at)) if *expires_at <= Instant::now() => {
                entries.remove(key);
                Ok(None)
            }
            Some((status, _)) => Ok(Some(status.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, status: &JobStatus, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), (status.clone(), Instant::now() + ttl));
        Ok(())
    }

    async fn try_acquire_lease(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let mut leases = self.leases.lock().await;
        let now = Instant::now();

        if let Some((_, expires_at)) = leases.get(key) {
            if *expires_at > now {
                return Ok(false);
            }
        }

        leases.insert(key.to_string(), (holder.to_string(), now + ttl));
        Ok(true)
    }

    async fn release_lease(&self, key: &str, holder: &str) -> Result<bool> {
        let mut leases = self.leases.lock().await;

        let held = matches!(
            leases.get(key),
            Some((owner, expires_at)) if owner == holder && *expires_at > Instant::now()
        );
        if held {
            leases.remove(key);
        }

        Ok(held)
    }
}
