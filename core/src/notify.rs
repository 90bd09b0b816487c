//! Payload types for the two Postgres notification channels that make up
//! the realtime status-broadcast plane (§4.4). Producers (the queue and
//! chart stores) serialize these to JSON and emit them via `pg_notify`
//! inside the same transaction as the state change they describe; the
//! `listener` binary is the sole consumer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const JOB_STATUS_CHANNEL: &str = "job_status_update";
pub const CHART_STATUS_CHANNEL: &str = "chart_status_update";

/// Payload emitted on `job_status_update`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusEvent {
    pub job_id: i64,
    pub status: String,
    pub phase: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Payload emitted on `chart_status_update`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartStatusEvent {
    pub session_id: String,
    pub ai_status: String,
    pub timestamp: DateTime<Utc>,
}

/// Emit `payload` as a `pg_notify(channel, payload)` call using the given
/// executor. Passing a transaction's connection here is what makes the
/// notification commit-or-nothing with the row update it describes,
/// closing the specification's "notification liveness" open question.
pub async fn notify<'c, E>(executor: E, channel: &str, payload: &str) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(channel)
        .bind(payload)
        .execute(executor)
        .await?;
    Ok(())
}
