//! # ChartStore
//!
//! Durable record of each processing subject (§4.2) and the state machine
//! the dashboard observes. All mutating methods run inside the same
//! transaction as their `chart_status_update` notification.

use chrono::Utc;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Postgres;

use crate::error::ChartError;
use crate::models::{AiStatus, Chart, ChartMetadata, ReviewStatus};
use crate::notify::{self, ChartStatusEvent, CHART_STATUS_CHANNEL};

pub type ChartResult<T> = std::result::Result<T, ChartError>;

pub struct ChartStore {
    pool: PgPool,
}

impl ChartStore {
    pub async fn new(database_url: &str, max_connections: u32) -> ChartResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|error| ChartError::ConnectionError { error })?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Upsert by `session_id`. On conflict, merges the incoming document
    /// count and metadata into the existing row; `ai_status` is preserved
    /// if it is already `ready` or `submitted`, otherwise forced back to
    /// `queued` (this is what lets a later upload batch add documents to
    /// an already-processed chart without regressing its status).
    pub async fn create_queued(
        &self,
        session_id: &str,
        chart_number: &str,
        metadata: &ChartMetadata,
        document_count: i32,
    ) -> ChartResult<Chart> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| ChartError::query("BEGIN", error))?;

        let chart: Chart = sqlx::query_as(
            r#"
INSERT INTO charts (session_id, chart_number, metadata, document_count, ai_status)
VALUES ($1, $2, $3, $4, 'queued')
ON CONFLICT (session_id) DO UPDATE SET
    document_count = charts.document_count + EXCLUDED.document_count,
    metadata = charts.metadata || EXCLUDED.metadata,
    ai_status = CASE
        WHEN charts.ai_status IN ('ready', 'submitted') THEN charts.ai_status
        ELSE 'queued'
    END,
    updated_at = NOW()
RETURNING *
            "#,
        )
        .bind(session_id)
        .bind(chart_number)
        .bind(sqlx::types::Json(metadata))
        .bind(document_count)
        .fetch_one(&mut *tx)
        .await
        .map_err(|error| ChartError::query("INSERT", error))?;

        self.emit_chart_status(&mut tx, session_id, chart.ai_status)
            .await?;

        tx.commit()
            .await
            .map_err(|error| ChartError::query("COMMIT", error))?;

        Ok(chart)
    }

    pub async fn mark_processing(&self, chart_number: &str) -> ChartResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| ChartError::query("BEGIN", error))?;

        let session_id: Option<String> = sqlx::query_scalar(
            r#"
UPDATE charts
SET ai_status = 'processing', processing_started_at = NOW(), updated_at = NOW()
WHERE chart_number = $1
RETURNING session_id
            "#,
        )
        .bind(chart_number)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|error| ChartError::query("UPDATE", error))?;

        if let Some(session_id) = session_id {
            self.emit_chart_status(&mut tx, &session_id, AiStatus::Processing)
                .await?;
        }

        tx.commit()
            .await
            .map_err(|error| ChartError::query("COMMIT", error))?;

        Ok(())
    }

    /// Write the AI result, snapshot the original codes, and transition to
    /// `ready`. `original_ai_codes` is only ever written here, and only on
    /// the first successful generation since the chart was created or last
    /// reset via `reset_for_retry` -- we never overwrite a non-null value,
    /// so a reprocessing triggered by `reset_for_retry` (which clears it)
    /// re-snapshots, while a retry after a transient `fail` (which leaves
    /// it set) does not.
    pub async fn store_results(
        &self,
        chart_number: &str,
        ai_result: &Value,
        original_ai_codes: &Value,
    ) -> ChartResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| ChartError::query("BEGIN", error))?;

        let session_id: Option<String> = sqlx::query_scalar(
            r#"
UPDATE charts
SET
    ai_result = $2,
    original_ai_codes = COALESCE(original_ai_codes, $3),
    ai_status = 'ready',
    processing_completed_at = NOW(),
    last_error = NULL,
    last_error_at = NULL,
    retry_count = 0,
    updated_at = NOW()
WHERE chart_number = $1
RETURNING session_id
            "#,
        )
        .bind(chart_number)
        .bind(sqlx::types::Json(ai_result))
        .bind(sqlx::types::Json(original_ai_codes))
        .fetch_optional(&mut *tx)
        .await
        .map_err(|error| ChartError::query("UPDATE", error))?;

        if let Some(session_id) = session_id {
            self.emit_chart_status(&mut tx, &session_id, AiStatus::Ready)
                .await?;
        }

        tx.commit()
            .await
            .map_err(|error| ChartError::query("COMMIT", error))?;

        Ok(())
    }

    /// Record a processing error. `will_retry` selects between
    /// `retry_pending` and the terminal `failed` status.
    pub async fn record_error(
        &self,
        chart_number: &str,
        error: &str,
        will_retry: bool,
        attempts: i32,
    ) -> ChartResult<()> {
        let status = if will_retry {
            AiStatus::RetryPending
        } else {
            AiStatus::Failed
        };

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| ChartError::query("BEGIN", error))?;

        let session_id: Option<String> = sqlx::query_scalar(
            r#"
UPDATE charts
SET
    ai_status = $2,
    last_error = $3,
    last_error_at = NOW(),
    retry_count = $4,
    updated_at = NOW()
WHERE chart_number = $1
RETURNING session_id
            "#,
        )
        .bind(chart_number)
        .bind(status)
        .bind(error)
        .bind(attempts)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|error| ChartError::query("UPDATE", error))?;

        if let Some(session_id) = session_id {
            self.emit_chart_status(&mut tx, &session_id, status).await?;
        }

        tx.commit()
            .await
            .map_err(|error| ChartError::query("COMMIT", error))?;

        Ok(())
    }

    /// Administrative reset: only valid from `failed` or `retry_pending`.
    /// Clears `original_ai_codes` (and `ai_result`) along with the error
    /// state so the next `store_results` after reprocessing re-snapshots
    /// a fresh "original" generation rather than keeping the one from
    /// before the reset. Distinguishes a missing chart from one that
    /// exists but is in the wrong state, unlike the other transitions
    /// here which only ever see a chart_number from a job already known
    /// to reference one.
    pub async fn reset_for_retry(&self, chart_number: &str) -> ChartResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| ChartError::query("BEGIN", error))?;

        let current: Chart = sqlx::query_as("SELECT * FROM charts WHERE chart_number = $1 FOR UPDATE")
            .bind(chart_number)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|error| ChartError::query("SELECT", error))?
            .ok_or_else(|| ChartError::ChartNotFound(chart_number.to_owned()))?;

        if !matches!(current.ai_status, AiStatus::Failed | AiStatus::RetryPending) {
            return Err(ChartError::InvalidTransition(
                chart_number.to_owned(),
                current.ai_status,
            ));
        }

        sqlx::query(
            r#"
UPDATE charts
SET
    ai_status = 'queued',
    ai_result = NULL,
    original_ai_codes = NULL,
    last_error = NULL,
    last_error_at = NULL,
    retry_count = 0,
    updated_at = NOW()
WHERE chart_number = $1
            "#,
        )
        .bind(chart_number)
        .execute(&mut *tx)
        .await
        .map_err(|error| ChartError::query("UPDATE", error))?;

        self.emit_chart_status(&mut tx, &current.session_id, AiStatus::Queued)
            .await?;

        tx.commit()
            .await
            .map_err(|error| ChartError::query("COMMIT", error))?;

        Ok(())
    }

    pub async fn save_user_modifications(
        &self,
        chart_number: &str,
        modifications: &Value,
    ) -> ChartResult<()> {
        sqlx::query(
            "UPDATE charts SET user_modifications = $2, updated_at = NOW() WHERE chart_number = $1",
        )
        .bind(chart_number)
        .bind(sqlx::types::Json(modifications))
        .execute(&self.pool)
        .await
        .map_err(|error| ChartError::query("UPDATE", error))?;

        Ok(())
    }

    /// Freeze the AI fields by moving to `review_status = submitted`. The
    /// invariant `submitted ⇒ final_codes ≠ null ∧ submitted_at ≠ null` is
    /// enforced by requiring `final_codes` as an argument here.
    pub async fn submit_final_codes(
        &self,
        chart_number: &str,
        final_codes: &Value,
    ) -> ChartResult<()> {
        sqlx::query(
            r#"
UPDATE charts
SET
    final_codes = $2,
    review_status = 'submitted',
    submitted_at = NOW(),
    updated_at = NOW()
WHERE chart_number = $1
            "#,
        )
        .bind(chart_number)
        .bind(sqlx::types::Json(final_codes))
        .execute(&self.pool)
        .await
        .map_err(|error| ChartError::query("UPDATE", error))?;

        Ok(())
    }

    pub async fn update_review_status(
        &self,
        chart_number: &str,
        review_status: ReviewStatus,
    ) -> ChartResult<()> {
        sqlx::query("UPDATE charts SET review_status = $2, updated_at = NOW() WHERE chart_number = $1")
            .bind(chart_number)
            .bind(review_status)
            .execute(&self.pool)
            .await
            .map_err(|error| ChartError::query("UPDATE", error))?;

        Ok(())
    }

    pub async fn get_by_chart_number(&self, chart_number: &str) -> ChartResult<Option<Chart>> {
        sqlx::query_as("SELECT * FROM charts WHERE chart_number = $1")
            .bind(chart_number)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| ChartError::query("SELECT", error))
    }

    pub async fn get_by_session_id(&self, session_id: &str) -> ChartResult<Option<Chart>> {
        sqlx::query_as("SELECT * FROM charts WHERE session_id = $1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| ChartError::query("SELECT", error))
    }

    pub async fn get_by_id(&self, chart_id: i64) -> ChartResult<Option<Chart>> {
        sqlx::query_as("SELECT * FROM charts WHERE id = $1")
            .bind(chart_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| ChartError::query("SELECT", error))
    }

    async fn emit_chart_status(
        &self,
        tx: &mut sqlx::Transaction<'_, Postgres>,
        session_id: &str,
        ai_status: AiStatus,
    ) -> ChartResult<()> {
        let event = ChartStatusEvent {
            session_id: session_id.to_owned(),
            ai_status: serde_json::to_value(ai_status)
                .ok()
                .and_then(|value| value.as_str().map(str::to_owned))
                .unwrap_or_default(),
            timestamp: Utc::now(),
        };
        let payload = serde_json::to_string(&event).unwrap_or_default();
        notify::notify(&mut **tx, CHART_STATUS_CHANNEL, &payload)
            .await
            .map_err(|error| ChartError::query("NOTIFY", error))
    }
}
