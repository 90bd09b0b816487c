//! Domain types shared by every crate in the workspace: the chart, document,
//! and job row shapes, plus the small tagged-variant types that travel inside
//! a job's opaque `job_data` payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The coding status of a chart, driven exclusively by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "ai_status")]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AiStatus {
    Queued,
    Processing,
    Ready,
    RetryPending,
    Failed,
    Submitted,
}

/// The human-review status of a chart, driven by the (out of scope) review UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "review_status")]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    InReview,
    Submitted,
    Rejected,
}

/// The per-document OCR/extraction status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "ocr_status")]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OcrStatus {
    Pending,
    Completed,
    Failed,
}

/// The status of a row in `processing_queue`. Deliberately only the four
/// variants the specification names -- there is no separate "retryable"
/// status: a job eligible for retry is simply `Failed` with `attempts <
/// max_attempts` and an elapsed `retry_after`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "job_status")]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// A derived status exposed to operators, refining `Failed` into its two
/// sub-cases and `Pending` into whether it is actually claimable yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectiveStatus {
    Pending,
    Processing,
    Completed,
    PermanentlyFailed,
    WaitingForRetry,
    ReadyToRetry,
}

/// Free-form patient/facility/specialty/provider/date metadata attached to a chart.
/// Kept as a loosely typed bag since the read-model / ingress layer that
/// populates it is out of scope here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChartMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facility: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specialty: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_of_service: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A chart row as read back from the database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Chart {
    pub id: i64,
    pub session_id: String,
    pub chart_number: String,
    pub metadata: sqlx::types::Json<ChartMetadata>,
    pub document_count: i32,
    pub ai_status: AiStatus,
    pub review_status: ReviewStatus,
    pub ai_result: Option<sqlx::types::Json<serde_json::Value>>,
    pub original_ai_codes: Option<sqlx::types::Json<serde_json::Value>>,
    pub user_modifications: Option<sqlx::types::Json<serde_json::Value>>,
    pub final_codes: Option<sqlx::types::Json<serde_json::Value>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_completed_at: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A document row as read back from the database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Document {
    pub id: i64,
    pub chart_id: i64,
    pub mime_type: String,
    pub size_bytes: i64,
    pub blob_key: String,
    pub blob_url: String,
    pub blob_bucket: String,
    pub ocr_status: OcrStatus,
    pub ocr_text: Option<String>,
    pub ocr_processing_ms: Option<i64>,
    pub ai_document_summary: Option<String>,
    pub transaction_id: Uuid,
    pub transaction_label: Option<String>,
    pub is_group_member: bool,
    pub created_at: DateTime<Utc>,
}

/// Fields required to insert a new document. Blob location is supplied up
/// front and is immutable thereafter per the data model's invariant.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub chart_id: i64,
    pub mime_type: String,
    pub size_bytes: i64,
    pub blob_key: String,
    pub blob_url: String,
    pub blob_bucket: String,
    pub transaction_id: Uuid,
    pub transaction_label: Option<String>,
    pub is_group_member: bool,
}

/// One document reference as it appears inside a job's `job_data` payload.
/// Only the chart id is authoritative -- the worker re-reads the live
/// document list from the chart store rather than trusting this list, so
/// documents added between enqueue and claim are still picked up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDocumentRef {
    pub document_id: i64,
}

/// The opaque payload stored in `processing_queue.job_data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobData {
    pub chart_id: i64,
    pub chart_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub documents: Vec<JobDocumentRef>,
}

/// A job row as read back from the database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Job {
    pub id: i64,
    pub chart_id: i64,
    pub chart_number: String,
    pub status: JobStatus,
    pub job_data: sqlx::types::Json<JobData>,
    pub worker_id: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub error_message: Option<String>,
    pub retry_after: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// The outcome of a `QueueStore::fail` call: everything the caller needs to
/// decide how to update the owning chart's status.
#[derive(Debug, Clone, PartialEq)]
pub struct FailOutcome {
    pub attempts: i32,
    pub max_attempts: i32,
    pub will_retry: bool,
    pub retry_after: Option<DateTime<Utc>>,
    pub is_permanently_failed: bool,
}

/// Observability summary returned by `QueueStore::get_job_status`.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    pub job_id: i64,
    pub status: JobStatus,
    pub effective_status: EffectiveStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub retry_in_seconds: Option<i64>,
    pub error_message: Option<String>,
}

/// Aggregate counters returned by `QueueStore::get_stats`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub waiting_for_retry: i64,
}
