use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{resolve_i32_env, resolve_i64_env, resolve_string_env};
use crate::pg::{
    build_pool, drop_pool_off_thread, is_valid_table_name, PgConnection, PgPool, PoolBuildError,
};

#[derive(Debug, thiserror::Error)]
pub enum JobQueueError {
    #[error("postgres error: {0}")]
    Postgres(#[from] postgres::Error),
    #[error("pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid job queue table name: {0}")]
    InvalidTableName(String),
    #[error("job queue config error: {0}")]
    Config(String),
    #[error("job queue unavailable: {0}")]
    Unavailable(String),
}

impl From<PoolBuildError> for JobQueueError {
    fn from(err: PoolBuildError) -> Self {
        match err {
            PoolBuildError::Postgres(err) => JobQueueError::Postgres(err),
            PoolBuildError::Pool(err) => JobQueueError::Pool(err),
            PoolBuildError::Tls(detail) => JobQueueError::Config(detail),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    Materialize,
    Classify,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Materialize => "MATERIALIZE",
            JobType::Classify => "CLASSIFY",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Turns a `received` event into conversation/message rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterializeJob {
    pub event_id: Uuid,
    pub workspace_id: Uuid,
    #[serde(default)]
    pub run_id: Option<Uuid>,
    pub channel: String,
    #[serde(default)]
    pub config_id: Option<Uuid>,
    #[serde(default)]
    pub supervisor_nudge: bool,
    #[serde(default)]
    pub nudged_at: Option<DateTime<Utc>>,
}

/// Attaches an AI classification to one inbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifyJob {
    pub workspace_id: Uuid,
    #[serde(default)]
    pub run_id: Option<Uuid>,
    #[serde(default)]
    pub config_id: Option<Uuid>,
    pub channel: String,
    pub event_id: Uuid,
    pub conversation_id: Uuid,
    pub target_message_id: Uuid,
    #[serde(default)]
    pub supervisor_nudge: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "job_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineJob {
    Materialize(MaterializeJob),
    Classify(ClassifyJob),
}

impl PipelineJob {
    pub fn job_type(&self) -> JobType {
        match self {
            PipelineJob::Materialize(_) => JobType::Materialize,
            PipelineJob::Classify(_) => JobType::Classify,
        }
    }

    pub fn workspace_id(&self) -> Uuid {
        match self {
            PipelineJob::Materialize(job) => job.workspace_id,
            PipelineJob::Classify(job) => job.workspace_id,
        }
    }

    pub fn event_id(&self) -> Uuid {
        match self {
            PipelineJob::Materialize(job) => job.event_id,
            PipelineJob::Classify(job) => job.event_id,
        }
    }
}

/// Delivery options for one send. A repeated `idempotency_key` is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub idempotency_key: String,
    pub delay: Duration,
}

impl EnqueueOptions {
    pub fn immediate(idempotency_key: impl Into<String>) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnqueueResult {
    pub inserted: bool,
}

#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub id: Uuid,
    pub attempts: i32,
    pub job: PipelineJob,
}

/// At-least-once job queue consumed by the MATERIALIZE/CLASSIFY workers.
pub trait JobQueue: Send + Sync {
    fn enqueue(
        &self,
        job: &PipelineJob,
        options: &EnqueueOptions,
    ) -> Result<EnqueueResult, JobQueueError>;
    fn claim_next(&self, job_type: JobType) -> Result<Option<QueuedJob>, JobQueueError>;
    fn mark_done(&self, id: &Uuid) -> Result<(), JobQueueError>;
    fn mark_failed(&self, id: &Uuid, error: &str) -> Result<(), JobQueueError>;
}

/// Retry delay after the given number of attempts.
pub(crate) fn failure_backoff_secs(attempts: i32) -> i64 {
    i64::from(attempts.max(1)).saturating_mul(5)
}

#[derive(Clone)]
pub struct PostgresJobQueue {
    pool: Option<PgPool>,
    table: String,
    lease_secs: i64,
    max_attempts: i32,
}

impl PostgresJobQueue {
    pub fn new_from_url(db_url: &str) -> Result<Self, JobQueueError> {
        let table =
            resolve_string_env("PIPELINE_QUEUE_TABLE").unwrap_or_else(|| "pipeline_jobs".to_string());
        let lease_secs = resolve_i64_env("PIPELINE_QUEUE_LEASE_SECS", 60);
        let max_attempts = resolve_i32_env("PIPELINE_QUEUE_MAX_ATTEMPTS", 5);
        Self::new(db_url, &table, lease_secs, max_attempts)
    }

    pub fn new(
        db_url: &str,
        table: &str,
        lease_secs: i64,
        max_attempts: i32,
    ) -> Result<Self, JobQueueError> {
        if !is_valid_table_name(table) {
            return Err(JobQueueError::InvalidTableName(table.to_string()));
        }
        let pool = build_pool(db_url, 4, "job_queue")?;
        let queue = Self {
            pool: Some(pool),
            table: table.to_string(),
            lease_secs,
            max_attempts,
        };
        queue.ensure_schema()?;
        Ok(queue)
    }

    fn connection(&self) -> Result<PgConnection, JobQueueError> {
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| JobQueueError::Unavailable("job queue pool dropped".to_string()))?;
        Ok(pool.get()?)
    }

    fn ensure_schema(&self) -> Result<(), JobQueueError> {
        let mut conn = self.connection()?;
        let index_prefix = self.table.replace('.', "_");
        let statement = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id UUID PRIMARY KEY,
                job_type TEXT NOT NULL,
                workspace_id UUID NOT NULL,
                idempotency_key TEXT NOT NULL UNIQUE,
                payload_json TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                available_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                locked_at TIMESTAMPTZ,
                locked_by TEXT,
                processed_at TIMESTAMPTZ,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT
            );
            CREATE INDEX IF NOT EXISTS {index_prefix}_claim_idx
                ON {table}(job_type, status, available_at);",
            table = self.table,
            index_prefix = index_prefix,
        );
        conn.batch_execute(&statement)?;
        Ok(())
    }

    pub fn drop_table(&self) -> Result<(), JobQueueError> {
        let mut conn = self.connection()?;
        conn.batch_execute(&format!("DROP TABLE IF EXISTS {}", self.table))?;
        Ok(())
    }
}

impl JobQueue for PostgresJobQueue {
    fn enqueue(
        &self,
        job: &PipelineJob,
        options: &EnqueueOptions,
    ) -> Result<EnqueueResult, JobQueueError> {
        let mut conn = self.connection()?;
        let payload_json = serde_json::to_string(job)?;
        let delay_ms = i64::try_from(options.delay.as_millis()).unwrap_or(i64::MAX);
        let rows = conn.execute(
            &format!(
                "INSERT INTO {table}
                    (id, job_type, workspace_id, idempotency_key, payload_json, status, created_at, available_at, attempts)
                 VALUES ($1, $2, $3, $4, $5, 'pending', now(), now() + ($6::bigint * interval '1 millisecond'), 0)
                 ON CONFLICT (idempotency_key) DO NOTHING",
                table = self.table
            ),
            &[
                &Uuid::new_v4(),
                &job.job_type().as_str(),
                &job.workspace_id(),
                &options.idempotency_key,
                &payload_json,
                &delay_ms,
            ],
        )?;
        Ok(EnqueueResult { inserted: rows > 0 })
    }

    fn claim_next(&self, job_type: JobType) -> Result<Option<QueuedJob>, JobQueueError> {
        let mut conn = self.connection()?;
        let instance_id = resolve_worker_instance_id();

        let mut tx = conn.transaction()?;
        let row = tx.query_opt(
            &format!(
                "SELECT id, payload_json
                 FROM {table}
                 WHERE job_type = $1
                   AND (
                     status = 'pending'
                     OR (status = 'processing' AND locked_at < now() - ($2::bigint * interval '1 second'))
                   )
                   AND available_at <= now()
                   AND attempts < $3
                 ORDER BY available_at
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED",
                table = self.table
            ),
            &[&job_type.as_str(), &self.lease_secs, &self.max_attempts],
        )?;

        let Some(row) = row else {
            tx.commit()?;
            return Ok(None);
        };
        let id: Uuid = row.get(0);
        let payload_json: String = row.get(1);

        let updated = tx.query_opt(
            &format!(
                "UPDATE {table}
                 SET status = 'processing',
                     locked_at = now(),
                     locked_by = $2,
                     attempts = attempts + 1
                 WHERE id = $1
                 RETURNING attempts",
                table = self.table
            ),
            &[&id, &instance_id],
        )?;
        tx.commit()?;

        let Some(updated) = updated else {
            return Ok(None);
        };
        let job: PipelineJob = serde_json::from_str(&payload_json)?;
        Ok(Some(QueuedJob {
            id,
            attempts: updated.get(0),
            job,
        }))
    }

    fn mark_done(&self, id: &Uuid) -> Result<(), JobQueueError> {
        let mut conn = self.connection()?;
        conn.execute(
            &format!(
                "UPDATE {table}
                 SET status = 'done',
                     processed_at = now(),
                     locked_at = NULL,
                     locked_by = NULL
                 WHERE id = $1",
                table = self.table
            ),
            &[id],
        )?;
        Ok(())
    }

    fn mark_failed(&self, id: &Uuid, error: &str) -> Result<(), JobQueueError> {
        let mut conn = self.connection()?;
        let attempts: i32 = conn
            .query_one(
                &format!("SELECT attempts FROM {table} WHERE id = $1", table = self.table),
                &[id],
            )?
            .get(0);

        let status = if attempts >= self.max_attempts {
            "failed"
        } else {
            "pending"
        };
        let backoff_secs = failure_backoff_secs(attempts);
        conn.execute(
            &format!(
                "UPDATE {table}
                 SET status = $2,
                     processed_at = now(),
                     locked_at = NULL,
                     locked_by = NULL,
                     available_at = now() + ($3::bigint * interval '1 second'),
                     last_error = $4
                 WHERE id = $1",
                table = self.table
            ),
            &[id, &status, &backoff_secs, &error],
        )?;
        Ok(())
    }
}

impl Drop for PostgresJobQueue {
    fn drop(&mut self) {
        drop_pool_off_thread(self.pool.take());
    }
}

fn resolve_worker_instance_id() -> String {
    resolve_string_env("WORKER_INSTANCE_ID")
        .or_else(|| resolve_string_env("HOSTNAME"))
        .unwrap_or_else(|| format!("pid-{}", std::process::id()))
}
