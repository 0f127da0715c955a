use anyhow::{Result, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use serde_json::Value;
use sqlx::{Pool, Postgres, postgres::PgPoolOptions};
use sqlx::types::Json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::cli::config::StorageSettings;

/// One recorded result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub result: Value,
}

impl HistoryEntry {
    pub fn now(result: Value) -> Self {
        Self { timestamp: Utc::now(), result }
    }
}

/// A recurring scrape of one URL plus its tracked keywords
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub owner_id: String,
    pub url: String,

    /// `daily`, `weekly`, `bi-weekly` or `monthly`; parsed when the schedule runs
    pub frequency: String,
    pub next_run_at: DateTime<Utc>,

    #[serde(default)]
    pub keywords: Vec<String>,

    #[serde(default)]
    pub history: Vec<HistoryEntry>,

    #[serde(default)]
    pub keyword_history: BTreeMap<String, Vec<HistoryEntry>>,

    pub created_at: DateTime<Utc>,
}

/// Fields supplied when creating a schedule
#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub owner_id: String,
    pub url: String,
    pub frequency: String,
    pub keywords: Vec<String>,

    /// First run; now when absent
    pub next_run_at: Option<DateTime<Utc>>,
}

impl Schedule {
    fn from_new(new: NewSchedule) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id: new.owner_id,
            url: new.url,
            frequency: new.frequency,
            next_run_at: new.next_run_at.unwrap_or(now),
            keywords: new.keywords,
            history: Vec::new(),
            keyword_history: BTreeMap::new(),
            created_at: now,
        }
    }
}

/// Persistent schedule records
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Schedules whose `next_run_at` is at or before `now`
    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>>;

    async fn create(&self, schedule: NewSchedule) -> Result<Schedule>;

    async fn update_next_run(&self, id: Uuid, next_run_at: DateTime<Utc>) -> Result<()>;

    /// Push onto the schedule's result history
    async fn append_history(&self, id: Uuid, entry: HistoryEntry) -> Result<()>;

    /// Push onto one keyword's history
    async fn append_keyword_history(&self, id: Uuid, keyword: &str, entry: HistoryEntry) -> Result<()>;
}

/// Build the store named by the storage settings
pub async fn create_store(settings: &StorageSettings) -> Result<Arc<dyn ScheduleStore>> {
    match settings.backend.as_str() {
        "postgresql" => {
            let store = PostgresScheduleStore::new(settings).await?;
            Ok(Arc::new(store))
        },
        "memory" => Ok(Arc::new(MemoryScheduleStore::new())),
        _ => {
            anyhow::bail!("Unsupported schedule storage backend: {}", settings.backend);
        }
    }
}

/// PostgreSQL implementation of ScheduleStore
pub struct PostgresScheduleStore {
    /// PostgreSQL connection pool
    pool: Pool<Postgres>,

    /// Schema name
    schema: String,
}

#[derive(sqlx::FromRow)]
struct ScheduleRow {
    id: Uuid,
    owner_id: String,
    url: String,
    frequency: String,
    next_run_at: DateTime<Utc>,
    keywords: Json<Vec<String>>,
    history: Json<Vec<HistoryEntry>>,
    keyword_history: Json<BTreeMap<String, Vec<HistoryEntry>>>,
    created_at: DateTime<Utc>,
}

impl From<ScheduleRow> for Schedule {
    fn from(row: ScheduleRow) -> Self {
        Self {
            id: row.id,
            owner_id: row.owner_id,
            url: row.url,
            frequency: row.frequency,
            next_run_at: row.next_run_at,
            keywords: row.keywords.0,
            history: row.history.0,
            keyword_history: row.keyword_history.0,
            created_at: row.created_at,
        }
    }
}

const COLUMNS: &str = "id, owner_id, url, frequency, next_run_at, keywords, history, keyword_history, created_at";

impl PostgresScheduleStore {
    /// Connect and make sure the schema and table exist
    pub async fn new(settings: &StorageSettings) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&settings.connection_string)
            .await
            .context(format!("Failed to connect to PostgreSQL: {}", settings.connection_string))?;

        let store = Self {
            pool,
            schema: settings.schema_name.clone(),
        };

        store.ensure_schema().await?;

        debug!("Connected to PostgreSQL database");

        Ok(store)
    }

    /// Ensure the schema and schedules table exist
    async fn ensure_schema(&self) -> Result<()> {
        let query = format!("CREATE SCHEMA IF NOT EXISTS {}", self.schema);

        sqlx::query(&query)
            .execute(&self.pool)
            .await
            .context(format!("Failed to create schema: {}", self.schema))?;

        let query = format!(
            "CREATE TABLE IF NOT EXISTS {}.schedules (
                id UUID PRIMARY KEY,
                owner_id TEXT NOT NULL,
                url TEXT NOT NULL,
                frequency TEXT NOT NULL,
                next_run_at TIMESTAMPTZ NOT NULL,
                keywords JSONB NOT NULL DEFAULT '[]',
                history JSONB NOT NULL DEFAULT '[]',
                keyword_history JSONB NOT NULL DEFAULT '{{}}',
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
            self.schema
        );

        sqlx::query(&query)
            .execute(&self.pool)
            .await
            .context("Failed to create schedules table")?;

        debug!("Ensured schedules table exists in schema: {}", self.schema);

        Ok(())
    }

    fn table(&self) -> String {
        format!("{}.schedules", self.schema)
    }
}

#[async_trait]
impl ScheduleStore for PostgresScheduleStore {
    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>> {
        let query = format!(
            "SELECT {} FROM {} WHERE next_run_at <= $1 ORDER BY next_run_at",
            COLUMNS, self.table()
        );

        let rows: Vec<ScheduleRow> = sqlx::query_as(&query)
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .context("Failed to query due schedules")?;

        Ok(rows.into_iter().map(Schedule::from).collect())
    }

    async fn create(&self, schedule: NewSchedule) -> Result<Schedule> {
        let schedule = Schedule::from_new(schedule);

        let query = format!(
            "INSERT INTO {} ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            self.table(), COLUMNS
        );

        sqlx::query(&query)
            .bind(schedule.id)
            .bind(&schedule.owner_id)
            .bind(&schedule.url)
            .bind(&schedule.frequency)
            .bind(schedule.next_run_at)
            .bind(Json(&schedule.keywords))
            .bind(Json(&schedule.history))
            .bind(Json(&schedule.keyword_history))
            .bind(schedule.created_at)
            .execute(&self.pool)
            .await
            .context("Failed to insert schedule")?;

        debug!("Created schedule {} for {}", schedule.id, schedule.url);

        Ok(schedule)
    }

    async fn update_next_run(&self, id: Uuid, next_run_at: DateTime<Utc>) -> Result<()> {
        let query = format!("UPDATE {} SET next_run_at = $2 WHERE id = $1", self.table());

        let result = sqlx::query(&query)
            .bind(id)
            .bind(next_run_at)
            .execute(&self.pool)
            .await
            .context("Failed to update next run")?;

        ensure_found(result.rows_affected(), id)
    }

    async fn append_history(&self, id: Uuid, entry: HistoryEntry) -> Result<()> {
        let query = format!(
            "UPDATE {} SET history = history || jsonb_build_array($2::jsonb) WHERE id = $1",
            self.table()
        );

        let result = sqlx::query(&query)
            .bind(id)
            .bind(Json(&entry))
            .execute(&self.pool)
            .await
            .context("Failed to append schedule history")?;

        ensure_found(result.rows_affected(), id)
    }

    async fn append_keyword_history(&self, id: Uuid, keyword: &str, entry: HistoryEntry) -> Result<()> {
        let query = format!(
            "UPDATE {} SET keyword_history = jsonb_set(
                keyword_history,
                ARRAY[$2::text],
                COALESCE(keyword_history -> $2::text, '[]'::jsonb) || jsonb_build_array($3::jsonb),
                true
            ) WHERE id = $1",
            self.table()
        );

        let result = sqlx::query(&query)
            .bind(id)
            .bind(keyword)
            .bind(Json(&entry))
            .execute(&self.pool)
            .await
            .context("Failed to append keyword history")?;

        ensure_found(result.rows_affected(), id)
    }
}

/// An UPDATE that matched no row means the schedule is gone
fn ensure_found(rows_affected: u64, id: Uuid) -> Result<()> {
    if rows_affected == 0 {
        anyhow::bail!("Schedule not found: {}", id);
    }
    Ok(())
}

/// In-process schedule store
#[derive(Default)]
pub struct MemoryScheduleStore {
    schedules: Mutex<HashMap<Uuid, Schedule>>,
}

impl MemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn get(&self, id: Uuid) -> Option<Schedule> {
        self.schedules.lock().await.get(&id).cloned()
    }

    async fn update(&self, id: Uuid, apply: impl FnOnce(&mut Schedule)) -> Result<()> {
        let mut schedules = self.schedules.lock().await;
        let schedule = schedules.get_mut(&id).context(format!("Schedule not found: {}", id))?;
        apply(schedule);
        Ok(())
    }
}

#[async_trait]
impl ScheduleStore for MemoryScheduleStore {
    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>> {
        let schedules = self.schedules.lock().await;
        let mut due: Vec<Schedule> = schedules.values()
            .filter(|s| s.next_run_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_run_at);
        Ok(due)
    }

    async fn create(&self, schedule: NewSchedule) -> Result<Schedule> {
        let schedule = Schedule::from_new(schedule);
        self.schedules.lock().await.insert(schedule.id, schedule.clone());
        Ok(schedule)
    }

    async fn update_next_run(&self, id: Uuid, next_run_at: DateTime<Utc>) -> Result<()> {
        self.update(id, |s| s.next_run_at = next_run_at).await
    }

    async fn append_history(&self, id: Uuid, entry: HistoryEntry) -> Result<()> {
        self.update(id, |s| s.history.push(entry)).await
    }

    async fn append_keyword_history(&self, id: Uuid, keyword: &str, entry: HistoryEntry) -> Result<()> {
        self.update(id, |s| {
            s.keyword_history.entry(keyword.to_string()).or_default().push(entry)
        }).await
    }
}
