//! The ingress hook (§4.5) is deliberately a contract, not an implemented
//! component: HTTP multipart upload, blob `PUT`, authentication, and the
//! CRUD read-model endpoints all live outside this crate's scope. This
//! module only pins down the three calls an (unimplemented) ingress layer
//! must make against the stores defined here, and the admin-retry
//! sequence, so that a future ingress implementation has an unambiguous
//! contract to code against.

use crate::chart::{ChartResult, ChartStore};
use crate::models::{ChartMetadata, JobData};
use crate::queue::{QueueResult, QueueStore};

/// The three-step contract an ingress (upload) handler must follow for one
/// upload batch:
///
/// 1. `ChartStore::create_queued` with the incoming `session_id`.
/// 2. `DocumentRepository::create` for each successfully stored blob.
/// 3. Exactly one `QueueStore::enqueue` per upload batch.
///
/// This trait exists only to document that sequence; a real ingress HTTP
/// handler is expected to call the three stores directly rather than
/// going through an implementation of this trait.
#[async_trait::async_trait]
pub trait IngressHook {
    async fn create_or_merge_chart(
        &self,
        session_id: &str,
        chart_number: &str,
        metadata: &ChartMetadata,
        document_count: i32,
    ) -> ChartResult<i64>;

    async fn enqueue_batch(
        &self,
        chart_id: i64,
        chart_number: &str,
        job_data: &JobData,
    ) -> QueueResult<Option<i64>>;
}

/// Whether a new upload batch against `chart_number` should enqueue a job,
/// given the chart's current `ai_status`. Resolves the specification's
/// open question: by default, a chart that has already reached
/// `submitted` does not get a fresh job enqueued underneath it; set
/// `enqueue_on_submitted` to override.
pub fn should_enqueue(current_ai_status: &str, enqueue_on_submitted: bool) -> bool {
    current_ai_status != "submitted" || enqueue_on_submitted
}

/// The admin retry endpoint's contract: reset the chart, then enqueue a
/// fresh job built from the chart's current document set. `job_data` must
/// be re-derived from the chart's live documents, not the stale set from
/// the original failed job.
pub async fn admin_retry(
    chart_store: &ChartStore,
    queue_store: &QueueStore,
    chart_number: &str,
    chart_id: i64,
    job_data: &JobData,
) -> Result<i64, AdminRetryError> {
    chart_store
        .reset_for_retry(chart_number)
        .await
        .map_err(AdminRetryError::Chart)?;

    queue_store
        .enqueue(chart_id, chart_number, job_data, 3)
        .await
        .map_err(AdminRetryError::Queue)
}

#[derive(Debug, thiserror::Error)]
pub enum AdminRetryError {
    #[error("chart store error: {0}")]
    Chart(#[from] crate::error::ChartError),
    #[error("queue store error: {0}")]
    Queue(#[from] crate::error::QueueError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submitted_chart_refuses_enqueue_by_default() {
        assert!(!should_enqueue("submitted", false));
        assert!(should_enqueue("submitted", true));
        assert!(should_enqueue("queued", false));
        assert!(should_enqueue("ready", false));
    }
}
