//! # QueueStore
//!
//! A work queue implementation backed by the `processing_queue` Postgres
//! table. The atomic claim uses a `FOR UPDATE SKIP LOCKED` CTE so that
//! concurrent workers competing for the same table never select the same
//! row, and every write that changes a row's `status` emits its
//! corresponding notification inside the same transaction as the write.

use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Postgres;

use crate::backoff;
use crate::error::QueueError;
use crate::models::{
    EffectiveStatus, FailOutcome, Job, JobData, JobStatus, JobStatusView, QueueStats,
};
use crate::notify::{self, ChartStatusEvent, JobStatusEvent, CHART_STATUS_CHANNEL, JOB_STATUS_CHANNEL};

pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// A queue implemented on top of the `processing_queue` PostgreSQL table.
pub struct QueueStore {
    pool: PgPool,
}

impl QueueStore {
    /// Connect to `database_url` and build a queue store on top of the pool.
    pub async fn new(database_url: &str, max_connections: u32) -> QueueResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|error| QueueError::ConnectionError { error })?;

        Ok(Self { pool })
    }

    /// Build a queue store on top of an already-constructed pool. Used by
    /// tests (via `#[sqlx::test]`) and by binaries that share one pool
    /// across the queue store and the chart store.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert a new job row in `pending` status. Idempotency of the
    /// triggering upload is the caller's responsibility -- it lives on
    /// `charts.session_id`, not here.
    pub async fn enqueue(
        &self,
        chart_id: i64,
        chart_number: &str,
        job_data: &JobData,
        max_attempts: i32,
    ) -> QueueResult<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
INSERT INTO processing_queue
    (chart_id, chart_number, status, job_data, attempts, max_attempts, created_at)
VALUES
    ($1, $2, 'pending', $3, 0, $4, NOW())
RETURNING id
            "#,
        )
        .bind(chart_id)
        .bind(chart_number)
        .bind(sqlx::types::Json(job_data))
        .bind(max_attempts)
        .fetch_one(&self.pool)
        .await
        .map_err(|error| QueueError::query("INSERT", error))?;

        Ok(row.0)
    }

    /// Atomically select the single highest-priority claimable row and mark
    /// it `processing`. Pending jobs are claimed strictly before retryable
    /// (failed-but-eligible) ones; within each class, oldest `created_at`
    /// wins.
    pub async fn claim_next(&self, worker_id: &str) -> QueueResult<Option<Job>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| QueueError::query("BEGIN", error))?;

        let claimed: Option<Job> = sqlx::query_as(
            r#"
WITH claimable AS (
    SELECT id
    FROM processing_queue
    WHERE status = 'pending'
       OR (status = 'failed' AND attempts < max_attempts
           AND (retry_after IS NULL OR retry_after <= NOW()))
    ORDER BY
        (status != 'pending'),
        created_at ASC
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
UPDATE processing_queue
SET
    worker_id = $1,
    locked_at = NOW(),
    started_at = COALESCE(processing_queue.started_at, NOW()),
    attempts = processing_queue.attempts + 1,
    retry_after = NULL,
    status = 'processing'
FROM claimable
WHERE processing_queue.id = claimable.id
RETURNING processing_queue.*
            "#,
        )
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|error| QueueError::query("UPDATE", error))?;

        if let Some(ref job) = claimed {
            self.emit_job_status(
                &mut tx,
                job.id,
                JobStatus::Processing,
                "claimed",
                &format!("claimed by {worker_id}"),
            )
            .await?;
        }

        tx.commit()
            .await
            .map_err(|error| QueueError::query("COMMIT", error))?;

        Ok(claimed)
    }

    /// Mark a job completed. Idempotent: completing an already-completed
    /// job is a no-op success.
    pub async fn complete(&self, job_id: i64) -> QueueResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| QueueError::query("BEGIN", error))?;

        let updated = sqlx::query(
            r#"
UPDATE processing_queue
SET
    status = 'completed',
    completed_at = NOW(),
    worker_id = NULL,
    locked_at = NULL,
    error_message = NULL,
    retry_after = NULL
WHERE id = $1 AND status != 'completed'
            "#,
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .map_err(|error| QueueError::query("UPDATE", error))?;

        if updated.rows_affected() > 0 {
            self.emit_job_status(&mut tx, job_id, JobStatus::Completed, "completed", "completed")
                .await?;
        }

        tx.commit()
            .await
            .map_err(|error| QueueError::query("COMMIT", error))?;

        Ok(())
    }

    /// Mark a job failed, scheduling a retry if attempts remain.
    pub async fn fail(&self, job_id: i64, error: &str) -> QueueResult<FailOutcome> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| QueueError::query("BEGIN", error))?;

        let row: (i32, i32) = sqlx::query_as(
            "SELECT attempts, max_attempts FROM processing_queue WHERE id = $1 FOR UPDATE",
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|error| QueueError::query("SELECT", error))?
        .ok_or(QueueError::JobNotFound(job_id))?;

        let (attempts, max_attempts) = row;
        let will_retry = attempts < max_attempts;
        let retry_after = if will_retry {
            Some(Utc::now() + backoff::delay_for(attempts - 1))
        } else {
            None
        };

        sqlx::query(
            r#"
UPDATE processing_queue
SET
    status = 'failed',
    error_message = $2,
    worker_id = NULL,
    locked_at = NULL,
    retry_after = $3
WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(error)
        .bind(retry_after)
        .execute(&mut *tx)
        .await
        .map_err(|error| QueueError::query("UPDATE", error))?;

        let phase = if will_retry { "retry_pending" } else { "permanently_failed" };
        self.emit_job_status(&mut tx, job_id, JobStatus::Failed, phase, error)
            .await?;

        tx.commit()
            .await
            .map_err(|error| QueueError::query("COMMIT", error))?;

        Ok(FailOutcome {
            attempts,
            max_attempts,
            will_retry,
            retry_after,
            is_permanently_failed: !will_retry,
        })
    }

    /// Recover jobs whose lease has gone stale: a worker claimed them but
    /// never reported back within `stuck_minutes`. They are converted to
    /// `failed` with a synthetic error and a short, fixed retry delay so
    /// they are picked up again soon rather than waiting out the normal
    /// backoff curve.
    pub async fn release_stuck(&self, stuck_minutes: i64) -> QueueResult<u64> {
        let result = sqlx::query(
            r#"
UPDATE processing_queue
SET
    status = 'failed',
    error_message = 'lease expired: worker did not report back before the stuck-lease threshold',
    worker_id = NULL,
    locked_at = NULL,
    retry_after = NOW() + INTERVAL '30 seconds'
WHERE status = 'processing'
  AND locked_at < NOW() - ($1 || ' minutes')::interval
            "#,
        )
        .bind(stuck_minutes.to_string())
        .execute(&self.pool)
        .await
        .map_err(|error| QueueError::query("UPDATE", error))?;

        Ok(result.rows_affected())
    }

    /// Administrative reset: only valid from `failed`, returns a job to
    /// `pending` with a clean attempt counter.
    pub async fn retry(&self, job_id: i64) -> QueueResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| QueueError::query("BEGIN", error))?;

        let result = sqlx::query(
            r#"
UPDATE processing_queue
SET
    status = 'pending',
    attempts = 0,
    error_message = NULL,
    worker_id = NULL,
    locked_at = NULL,
    retry_after = NULL
WHERE id = $1 AND status = 'failed'
            "#,
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .map_err(|error| QueueError::query("UPDATE", error))?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotRetryable(job_id));
        }

        self.emit_job_status(&mut tx, job_id, JobStatus::Pending, "reset", "reset for retry")
            .await?;

        tx.commit()
            .await
            .map_err(|error| QueueError::query("COMMIT", error))?;

        Ok(())
    }

    pub async fn get_job(&self, job_id: i64) -> QueueResult<Option<Job>> {
        sqlx::query_as("SELECT * FROM processing_queue WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| QueueError::query("SELECT", error))
    }

    pub async fn jobs_by_chart(&self, chart_number: &str) -> QueueResult<Vec<Job>> {
        sqlx::query_as(
            "SELECT * FROM processing_queue WHERE chart_number = $1 ORDER BY created_at DESC",
        )
        .bind(chart_number)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| QueueError::query("SELECT", error))
    }

    /// Observability view: for every job belonging to `chart_number`,
    /// derive the refined `effective_status` and seconds-until-retry.
    pub async fn get_job_status(&self, chart_number: &str) -> QueueResult<Vec<JobStatusView>> {
        let jobs = self.jobs_by_chart(chart_number).await?;
        let now = Utc::now();

        Ok(jobs
            .into_iter()
            .map(|job| {
                let effective_status = effective_status(&job, now);
                let retry_in_seconds = job
                    .retry_after
                    .map(|retry_after| (retry_after - now).num_seconds().max(0));

                JobStatusView {
                    job_id: job.id,
                    status: job.status,
                    effective_status,
                    attempts: job.attempts,
                    max_attempts: job.max_attempts,
                    retry_in_seconds,
                    error_message: job.error_message,
                }
            })
            .collect())
    }

    pub async fn get_stats(&self) -> QueueResult<QueueStats> {
        let row: (i64, i64, i64, i64, i64) = sqlx::query_as(
            r#"
SELECT
    COUNT(*) FILTER (WHERE status = 'pending'),
    COUNT(*) FILTER (WHERE status = 'processing'),
    COUNT(*) FILTER (WHERE status = 'completed'),
    COUNT(*) FILTER (WHERE status = 'failed' AND attempts >= max_attempts),
    COUNT(*) FILTER (WHERE status = 'failed' AND attempts < max_attempts)
FROM processing_queue
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|error| QueueError::query("SELECT", error))?;

        Ok(QueueStats {
            pending: row.0,
            processing: row.1,
            completed: row.2,
            failed: row.3,
            waiting_for_retry: row.4,
        })
    }

    /// Emit a structured checkpoint on `job_status_update`. Used both
    /// internally (wrapped in the same transaction as a status-changing
    /// write) and directly by the worker to report phase progress that
    /// does not itself change `processing_queue.status`.
    pub async fn notify_status(
        &self,
        job_id: i64,
        status: &str,
        phase: &str,
        message: &str,
    ) -> QueueResult<()> {
        let event = JobStatusEvent {
            job_id,
            status: status.to_owned(),
            phase: phase.to_owned(),
            message: message.to_owned(),
            timestamp: Utc::now(),
        };
        let payload = serde_json::to_string(&event).unwrap_or_else(|_| json!({}).to_string());
        notify::notify(&self.pool, JOB_STATUS_CHANNEL, &payload)
            .await
            .map_err(|error| QueueError::query("NOTIFY", error))
    }

    /// Emit on `chart_status_update`. `session_id` may be absent from a
    /// job's data (e.g. for administrative retries); callers should skip
    /// calling this when there is no session to address.
    pub async fn notify_chart(&self, session_id: &str, ai_status: &str) -> QueueResult<()> {
        let event = ChartStatusEvent {
            session_id: session_id.to_owned(),
            ai_status: ai_status.to_owned(),
            timestamp: Utc::now(),
        };
        let payload = serde_json::to_string(&event).unwrap_or_else(|_| json!({}).to_string());
        notify::notify(&self.pool, CHART_STATUS_CHANNEL, &payload)
            .await
            .map_err(|error| QueueError::query("NOTIFY", error))
    }

    /// Delete completed jobs older than `older_than_days`. Never touches a
    /// row that isn't `completed` or whose `completed_at` hasn't yet aged
    /// past the threshold.
    pub async fn cleanup(&self, older_than_days: i64) -> QueueResult<u64> {
        let result = sqlx::query(
            r#"
DELETE FROM processing_queue
WHERE status = 'completed'
  AND completed_at < NOW() - ($1 || ' days')::interval
            "#,
        )
        .bind(older_than_days.to_string())
        .execute(&self.pool)
        .await
        .map_err(|error| QueueError::query("DELETE", error))?;

        Ok(result.rows_affected())
    }

    async fn emit_job_status(
        &self,
        tx: &mut sqlx::Transaction<'_, Postgres>,
        job_id: i64,
        status: JobStatus,
        phase: &str,
        message: &str,
    ) -> QueueResult<()> {
        let event = JobStatusEvent {
            job_id,
            status: serde_json::to_value(status)
                .ok()
                .and_then(|value| value.as_str().map(str::to_owned))
                .unwrap_or_default(),
            phase: phase.to_owned(),
            message: message.to_owned(),
            timestamp: Utc::now(),
        };
        let payload = serde_json::to_string(&event).unwrap_or_else(|_| json!({}).to_string());
        notify::notify(&mut **tx, JOB_STATUS_CHANNEL, &payload)
            .await
            .map_err(|error| QueueError::query("NOTIFY", error))
    }
}

fn effective_status(job: &Job, now: DateTime<Utc>) -> EffectiveStatus {
    match job.status {
        JobStatus::Pending => EffectiveStatus::Pending,
        JobStatus::Processing => EffectiveStatus::Processing,
        JobStatus::Completed => EffectiveStatus::Completed,
        JobStatus::Failed => {
            if job.attempts >= job.max_attempts {
                EffectiveStatus::PermanentlyFailed
            } else {
                match job.retry_after {
                    Some(retry_after) if retry_after > now => EffectiveStatus::WaitingForRetry,
                    _ => EffectiveStatus::ReadyToRetry,
                }
            }
        }
    }
}
