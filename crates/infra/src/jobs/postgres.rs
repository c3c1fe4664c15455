//! Postgres-backed job store.
//!
//! Every state transition runs inside a transaction, and every row that is
//! about to change is locked first. Claims and the reaper use
//! `FOR UPDATE SKIP LOCKED`, so concurrent workers never wait on each other and
//! never receive the same row.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (check constraint violation) | `23514` | `Validation` |
//! | Database (other) | Any other | `Database` |
//! | PoolClosed / Io / Tls / timeouts | N/A | `Database` |
//! | Decode / ColumnNotFound | N/A | `Storage` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, instrument, warn};

use jobsync_core::{JobId, WorkerId};

use super::backoff::BackoffPolicy;
use super::store::{stale_heartbeat_message, JobStore, JobStoreError};
use super::types::{
    ClaimFilter, DeadLetterEntry, FailOutcome, Job, JobStats, JobStatus, NewJob, ReapReport,
};

const JOB_COLUMNS: &str = r#"
    id, job_type, payload, priority, status, attempts, max_attempts, worker_id,
    created_at, started_at, heartbeat_at, completed_at, next_attempt_at, last_error, result
"#;

/// Postgres-backed durable job queue.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn begin(&self, operation: &str) -> Result<Transaction<'static, Postgres>, JobStoreError> {
        self.pool.begin().await.map_err(|e| map_sqlx_error(operation, e))
    }

    /// Distinguish "gone" from "held by someone else" after a guarded update matched nothing.
    async fn not_held(&self, operation: &str, id: JobId) -> JobStoreError {
        let exists = sqlx::query("SELECT 1 FROM jobs WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&*self.pool)
            .await;
        match exists {
            Ok(Some(_)) => JobStoreError::NotHeld(id),
            Ok(None) => JobStoreError::NotFound(id),
            Err(e) => map_sqlx_error(operation, e),
        }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_type = %job.job_type, priority = job.priority), err)]
    async fn enqueue(&self, job: NewJob) -> Result<JobId, JobStoreError> {
        job.validate()?;

        let row = sqlx::query(
            r#"
            INSERT INTO jobs (job_type, payload, priority, max_attempts, next_attempt_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(job.priority)
        .bind(job.max_attempts)
        .bind(job.run_at)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;

        let id: i64 = row.try_get("id").map_err(|e| map_sqlx_error("enqueue", e))?;
        debug!(job_id = id, "job enqueued");
        Ok(JobId::new(id))
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id.get())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        match row {
            Some(row) => {
                let job = JobRow::from_row(&row).map_err(|e| map_sqlx_error("get", e))?;
                Ok(Some(job.try_into()?))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self, filter), fields(worker_id = %worker), err)]
    async fn claim(&self, worker: &WorkerId, filter: &ClaimFilter) -> Result<Option<Job>, JobStoreError> {
        let mut tx = self.begin("claim").await?;

        let candidate = sqlx::query(
            r#"
            SELECT id
            FROM jobs
            WHERE status = 'pending'
              AND (next_attempt_at IS NULL OR next_attempt_at <= now())
              AND ($1::smallint IS NULL OR priority >= $1)
              AND ($2::smallint IS NULL OR priority <= $2)
              AND (NOT $3 OR (attempts > 0 AND next_attempt_at IS NOT NULL))
            ORDER BY priority DESC, id ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(filter.min_priority)
        .bind(filter.max_priority)
        .bind(filter.retries_only)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim", e))?;

        let Some(candidate) = candidate else {
            tx.commit().await.map_err(|e| map_sqlx_error("claim", e))?;
            return Ok(None);
        };
        let id: i64 = candidate.try_get("id").map_err(|e| map_sqlx_error("claim", e))?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET status = 'processing',
                worker_id = $2,
                started_at = now(),
                heartbeat_at = now()
            WHERE id = $1
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(worker.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim", e))?;

        tx.commit().await.map_err(|e| map_sqlx_error("claim", e))?;

        let job: Job = JobRow::from_row(&row).map_err(|e| map_sqlx_error("claim", e))?.try_into()?;
        debug!(job_id = %job.id, job_type = %job.job_type, "job claimed");
        Ok(Some(job))
    }

    async fn heartbeat(&self, id: JobId, worker: &WorkerId) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET heartbeat_at = now()
            WHERE id = $1 AND status = 'processing' AND worker_id = $2
            "#,
        )
        .bind(id.get())
        .bind(worker.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("heartbeat", e))?;

        if result.rows_affected() == 0 {
            return Err(self.not_held("heartbeat", id).await);
        }
        Ok(())
    }

    #[instrument(skip(self, result), fields(job_id = %id, worker_id = %worker), err)]
    async fn complete(
        &self,
        id: JobId,
        worker: &WorkerId,
        result: serde_json::Value,
    ) -> Result<(), JobStoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed',
                completed_at = now(),
                attempts = attempts + 1,
                next_attempt_at = NULL,
                result = $3
            WHERE id = $1 AND status = 'processing' AND worker_id = $2
            "#,
        )
        .bind(id.get())
        .bind(worker.as_str())
        .bind(&result)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete", e))?;

        if updated.rows_affected() == 0 {
            return Err(self.not_held("complete", id).await);
        }
        Ok(())
    }

    #[instrument(skip(self, error, backoff), fields(job_id = %id, worker_id = %worker), err)]
    async fn fail(
        &self,
        id: JobId,
        worker: &WorkerId,
        error: &str,
        backoff: &BackoffPolicy,
    ) -> Result<FailOutcome, JobStoreError> {
        let mut tx = self.begin("fail").await?;

        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.get())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("fail", e))?;

        let Some(row) = row else {
            return Err(JobStoreError::NotFound(id));
        };
        let job: Job = JobRow::from_row(&row).map_err(|e| map_sqlx_error("fail", e))?.try_into()?;
        if job.status != JobStatus::Processing || job.worker_id.as_ref() != Some(worker) {
            return Err(JobStoreError::NotHeld(id));
        }

        let outcome = record_failure(&mut tx, &job, error, backoff).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("fail", e))?;
        Ok(outcome)
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                status,
                priority,
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE next_attempt_at > now()) AS waiting
            FROM jobs
            GROUP BY status, priority
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("stats", e))?;
            let priority: i16 = row.try_get("priority").map_err(|e| map_sqlx_error("stats", e))?;
            let total: i64 = row.try_get("total").map_err(|e| map_sqlx_error("stats", e))?;
            let waiting: i64 = row.try_get("waiting").map_err(|e| map_sqlx_error("stats", e))?;
            let (total, waiting) = (total as u64, waiting as u64);

            match JobStatus::parse(&status) {
                Some(JobStatus::Pending) => {
                    stats.pending += total;
                    stats.waiting_on_backoff += waiting;
                    stats.by_priority.entry(priority).or_default().pending += total;
                }
                Some(JobStatus::Processing) => {
                    stats.processing += total;
                    stats.by_priority.entry(priority).or_default().processing += total;
                }
                Some(JobStatus::Completed) => stats.completed += total,
                None => warn!(status = %status, "unknown job status in stats"),
            }
        }

        let dead: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letter_jobs")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;
        stats.dead_lettered = dead as u64;

        Ok(stats)
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, job_type, payload, priority, last_error, attempts, created_at, dead_lettered_at
            FROM dead_letter_jobs
            ORDER BY dead_lettered_at DESC, id DESC
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_dead_letters", e))?;

        rows.iter()
            .map(|row| {
                DeadLetterRow::from_row(row)
                    .map(Into::into)
                    .map_err(|e| map_sqlx_error("list_dead_letters", e))
            })
            .collect()
    }

    #[instrument(skip(self), err)]
    async fn requeue_dead_letter(&self, dead_letter_id: i64) -> Result<JobId, JobStoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO jobs (job_type, payload, priority, max_attempts)
            SELECT job_type, payload, priority, GREATEST(attempts, 1)
            FROM dead_letter_jobs
            WHERE id = $1
            RETURNING id
            "#,
        )
        .bind(dead_letter_id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue_dead_letter", e))?
        .ok_or(JobStoreError::DeadLetterNotFound(dead_letter_id))?;

        let id: i64 = row
            .try_get("id")
            .map_err(|e| map_sqlx_error("requeue_dead_letter", e))?;
        Ok(JobId::new(id))
    }

    #[instrument(skip(self, backoff), err)]
    async fn reap_stale(
        &self,
        threshold: Duration,
        backoff: &BackoffPolicy,
    ) -> Result<ReapReport, JobStoreError> {
        let mut tx = self.begin("reap_stale").await?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE status = 'processing'
              AND (heartbeat_at IS NULL OR heartbeat_at < now() - make_interval(secs => $1))
            ORDER BY id ASC
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(threshold.as_secs_f64())
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("reap_stale", e))?;

        let mut report = ReapReport::default();
        for row in rows {
            let job: Job = JobRow::from_row(&row)
                .map_err(|e| map_sqlx_error("reap_stale", e))?
                .try_into()?;
            let message = stale_heartbeat_message(job.worker_id.as_ref());
            match record_failure(&mut tx, &job, &message, backoff).await? {
                FailOutcome::Retrying { .. } => report.requeued.push(job.id),
                FailOutcome::DeadLettered { .. } => report.dead_lettered.push(job.id),
            }
        }

        tx.commit().await.map_err(|e| map_sqlx_error("reap_stale", e))?;
        Ok(report)
    }

    #[instrument(skip(self), err)]
    async fn prune_completed(&self, older_than: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE status = 'completed' AND completed_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("prune_completed", e))?;

        Ok(result.rows_affected())
    }
}

/// Consume one attempt of a locked `processing` row: back to `pending` with a
/// backoff, or into the dead-letter table once the budget is spent.
async fn record_failure(
    tx: &mut Transaction<'static, Postgres>,
    job: &Job,
    error: &str,
    backoff: &BackoffPolicy,
) -> Result<FailOutcome, JobStoreError> {
    let attempts = job.attempts + 1;

    if attempts < job.max_attempts {
        let delay = backoff.delay(u32::try_from(attempts).unwrap_or(u32::MAX));
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                attempts = $2,
                worker_id = NULL,
                started_at = NULL,
                heartbeat_at = NULL,
                last_error = $3,
                next_attempt_at = now() + make_interval(secs => $4)
            WHERE id = $1
            RETURNING next_attempt_at
            "#,
        )
        .bind(job.id.get())
        .bind(attempts)
        .bind(error)
        .bind(delay.as_secs_f64())
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("fail", e))?;

        let next_attempt_at: DateTime<Utc> = row
            .try_get("next_attempt_at")
            .map_err(|e| map_sqlx_error("fail", e))?;

        warn!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempts,
            max_attempts = job.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error,
            "job failed, scheduled for retry"
        );
        return Ok(FailOutcome::Retrying {
            attempts,
            delay,
            next_attempt_at,
        });
    }

    sqlx::query(
        r#"
        INSERT INTO dead_letter_jobs (job_id, job_type, payload, priority, last_error, attempts, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(job.id.get())
    .bind(&job.job_type)
    .bind(&job.payload)
    .bind(job.priority)
    .bind(error)
    .bind(attempts)
    .bind(job.created_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("dead_letter", e))?;

    sqlx::query("DELETE FROM jobs WHERE id = $1")
        .bind(job.id.get())
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("dead_letter", e))?;

    error!(
        job_id = %job.id,
        job_type = %job.job_type,
        attempts,
        error,
        "job exhausted retries, moved to dead-letter queue"
    );
    Ok(FailOutcome::DeadLettered { attempts })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Check constraint violation
                Some("23514") => JobStoreError::Validation(msg),
                _ => JobStoreError::Database(msg),
            }
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::ColumnNotFound(_) | sqlx::Error::Decode(_) => {
            JobStoreError::Storage(format!("failed to decode row in {}: {}", operation, err))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Database(format!("connection pool closed in {}", operation))
        }
        _ => JobStoreError::Database(format!("sqlx error in {}: {}", operation, err)),
    }
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: i64,
    job_type: String,
    payload: serde_json::Value,
    priority: i16,
    status: String,
    attempts: i32,
    max_attempts: i32,
    worker_id: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    heartbeat_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    next_attempt_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    result: Option<serde_json::Value>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            job_type: row.try_get("job_type")?,
            payload: row.try_get("payload")?,
            priority: row.try_get("priority")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            worker_id: row.try_get("worker_id")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            heartbeat_at: row.try_get("heartbeat_at")?,
            completed_at: row.try_get("completed_at")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
            last_error: row.try_get("last_error")?,
            result: row.try_get("result")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = JobStatus::parse(&row.status).ok_or_else(|| {
            JobStoreError::Storage(format!("job {} has unknown status '{}'", row.id, row.status))
        })?;

        Ok(Job {
            id: JobId::new(row.id),
            job_type: row.job_type,
            payload: row.payload,
            priority: row.priority,
            status,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            worker_id: row.worker_id.map(WorkerId::named),
            created_at: row.created_at,
            started_at: row.started_at,
            heartbeat_at: row.heartbeat_at,
            completed_at: row.completed_at,
            next_attempt_at: row.next_attempt_at,
            last_error: row.last_error,
            result: row.result,
        })
    }
}

#[derive(Debug)]
struct DeadLetterRow {
    id: i64,
    job_id: i64,
    job_type: String,
    payload: serde_json::Value,
    priority: i16,
    last_error: String,
    attempts: i32,
    created_at: DateTime<Utc>,
    dead_lettered_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for DeadLetterRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(DeadLetterRow {
            id: row.try_get("id")?,
            job_id: row.try_get("job_id")?,
            job_type: row.try_get("job_type")?,
            payload: row.try_get("payload")?,
            priority: row.try_get("priority")?,
            last_error: row.try_get("last_error")?,
            attempts: row.try_get("attempts")?,
            created_at: row.try_get("created_at")?,
            dead_lettered_at: row.try_get("dead_lettered_at")?,
        })
    }
}

impl From<DeadLetterRow> for DeadLetterEntry {
    fn from(row: DeadLetterRow) -> Self {
        DeadLetterEntry {
            id: row.id,
            job_id: JobId::new(row.job_id),
            job_type: row.job_type,
            payload: row.payload,
            priority: row.priority,
            last_error: row.last_error,
            attempts: row.attempts,
            created_at: row.created_at,
            dead_lettered_at: row.dead_lettered_at,
        }
    }
}
