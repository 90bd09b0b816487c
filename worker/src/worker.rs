//! The chart-coding pipeline: claim a job, run OCR -> LLM -> persist, and
//! convert the outcome into exactly one terminal queue transition plus a
//! matching chart-status update.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time;

use chartflow_core::chart::ChartStore;
use chartflow_core::collaborators::{
    BlobStore, CodingRequest, DocumentText, DocxExtractor, LlmService, OcrService, SummaryRequest,
};
use chartflow_core::documents::DocumentRepository;
use chartflow_core::models::{Document, Job};
use chartflow_core::queue::QueueStore;
use health::HealthHandle;
use tracing::{error, info, warn};

use crate::error::PipelineError;

/// The four external collaborators a `ChartWorker` drives, bundled so tests
/// can substitute fakes implementing the same traits.
pub struct Collaborators {
    pub ocr: Arc<dyn OcrService>,
    pub llm: Arc<dyn LlmService>,
    pub blobs: Arc<dyn BlobStore>,
    pub docx: Arc<dyn DocxExtractor>,
}

/// One successful text extraction, carried from phase 2 into phases 3-4.
struct Extracted {
    document_id: i64,
    text: String,
}

pub struct ChartWorker {
    worker_id: String,
    queue: Arc<QueueStore>,
    charts: Arc<ChartStore>,
    documents: Arc<DocumentRepository>,
    collaborators: Collaborators,
    poll_interval: time::Duration,
    liveness: HealthHandle,
    draining: Arc<AtomicBool>,
}

impl ChartWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_id: String,
        queue: Arc<QueueStore>,
        charts: Arc<ChartStore>,
        documents: Arc<DocumentRepository>,
        collaborators: Collaborators,
        poll_interval: time::Duration,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            worker_id,
            queue,
            charts,
            documents,
            collaborators,
            poll_interval,
            liveness,
            draining: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Install ctrl_c and SIGTERM handlers that flip the drain flag, checked
    /// between jobs -- the current job always reaches a terminal transition
    /// before the process exits.
    pub fn install_shutdown_handlers(&self) {
        let draining = self.draining.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received ctrl_c, draining current job before exit");
                draining.store(true, Ordering::SeqCst);
            }
        });

        #[cfg(unix)]
        {
            let draining = self.draining.clone();
            tokio::spawn(async move {
                if let Ok(mut term) =
                    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                {
                    if term.recv().await.is_some() {
                        info!("received SIGTERM, draining current job before exit");
                        draining.store(true, Ordering::SeqCst);
                    }
                }
            });
        }
    }

    /// The main loop: claim, process to a terminal transition, repeat.
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            interval.tick().await;
            self.liveness.report_healthy().await;

            if self.draining.load(Ordering::SeqCst) {
                info!("worker draining, exiting loop");
                return;
            }

            let job = match self.queue.claim_next(&self.worker_id).await {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(error) => {
                    error!(error = %error, "failed to claim next job");
                    continue;
                }
            };

            info!(job_id = job.id, chart_number = %job.chart_number, attempt = job.attempts, "claimed job");

            self.process(job).await;
        }
    }

    /// Drive one claimed job through the five phases, converting the
    /// outcome into exactly one queue + chart transition.
    async fn process(&self, job: Job) {
        let job_id = job.id;
        let chart_number = job.chart_number.clone();
        let session_id = job.job_data.session_id.clone();

        match self.run_pipeline(&job).await {
            Ok(()) => {
                if let Err(error) = self.queue.complete(job_id).await {
                    error!(job_id, error = %error, "failed to mark job completed");
                    return;
                }
                info!(job_id, chart_number = %chart_number, "job completed");
            }
            Err(pipeline_error) => {
                let message = pipeline_error.to_string();
                warn!(job_id, chart_number = %chart_number, error = %message, "job failed");

                let outcome = match self.queue.fail(job_id, &message).await {
                    Ok(outcome) => outcome,
                    Err(error) => {
                        error!(job_id, error = %error, "failed to record job failure");
                        return;
                    }
                };

                if let Err(error) = self
                    .charts
                    .record_error(&chart_number, &message, outcome.will_retry, outcome.attempts)
                    .await
                {
                    error!(job_id, error = %error, "failed to record chart error");
                }

                if let Some(session_id) = session_id {
                    let ai_status = if outcome.will_retry { "retry_pending" } else { "failed" };
                    if let Err(error) = self.queue.notify_chart(&session_id, ai_status).await {
                        warn!(job_id, error = %error, "failed to emit chart status notification");
                    }
                }
            }
        }
    }

    async fn run_pipeline(&self, job: &Job) -> Result<(), PipelineError> {
        let chart_number = &job.chart_number;
        let chart_id = job.job_data.chart_id;

        // Phase 1: enter processing.
        self.charts.mark_processing(chart_number).await?;
        self.queue
            .notify_status(job.id, "processing", "entered", "marked chart processing")
            .await
            .ok();

        let documents = self
            .documents
            .by_chart_id(chart_id)
            .await
            .map_err(PipelineError::Persist)?;

        // Phase 2: text extraction, partial-failure tolerant.
        let extracted = self.extract_all(job.id, &documents).await;
        if extracted.is_empty() {
            return Err(PipelineError::NoDocumentsExtracted {
                attempted: documents.len(),
            });
        }

        self.queue
            .notify_status(
                job.id,
                "processing",
                "extracted",
                &format!("{}/{} documents extracted", extracted.len(), documents.len()),
            )
            .await
            .ok();

        // Phase 3: coding synthesis.
        let coding_request = CodingRequest {
            chart_number: chart_number.clone(),
            metadata: serde_json::Value::Null,
            documents: extracted
                .iter()
                .map(|e| DocumentText {
                    document_id: e.document_id,
                    text: e.text.clone(),
                })
                .collect(),
        };

        let coding_response = self
            .collaborators
            .llm
            .synthesize_codes(coding_request)
            .await?;

        let ai_result = match (coding_response.ok, coding_response.data) {
            (true, Some(data)) => data,
            _ => {
                return Err(PipelineError::Ai(
                    chartflow_core::error::CollaboratorError::AiFailed(
                        "LLM response missing ok=true/data".to_owned(),
                    ),
                ))
            }
        };

        self.queue
            .notify_status(job.id, "processing", "coded", "coding synthesis complete")
            .await
            .ok();

        // Phase 4: per-document summaries, best-effort.
        for extracted_document in &extracted {
            let request = SummaryRequest {
                document_id: extracted_document.document_id,
                text: extracted_document.text.clone(),
            };
            match self.collaborators.llm.summarize_document(request).await {
                Ok(summary) => {
                    if let Err(error) = self
                        .documents
                        .store_summary(extracted_document.document_id, &summary)
                        .await
                    {
                        warn!(document_id = extracted_document.document_id, error = %error, "failed to store document summary");
                    }
                }
                Err(error) => {
                    warn!(document_id = extracted_document.document_id, error = %error, "document summary failed, continuing");
                }
            }
        }

        // Phase 5: persist.
        self.charts
            .store_results(chart_number, &ai_result, &ai_result)
            .await?;

        Ok(())
    }

    /// Dispatch each document by mime type, collecting successful
    /// extractions while tolerating individual failures.
    async fn extract_all(&self, job_id: i64, documents: &[Document]) -> Vec<Extracted> {
        let mut extracted = Vec::with_capacity(documents.len());

        for document in documents {
            match self.extract_one(document).await {
                Ok(text) => {
                    info!(job_id, document_id = document.id, "extraction succeeded");
                    extracted.push(Extracted {
                        document_id: document.id,
                        text,
                    });
                }
                Err(error) => {
                    warn!(job_id, document_id = document.id, error = %error, "extraction failed");
                    if let Err(error) = self.documents.mark_extraction_failed(document.id).await {
                        warn!(document_id = document.id, error = %error, "failed to record extraction failure");
                    }
                }
            }
        }

        extracted
    }

    async fn extract_one(
        &self,
        document: &Document,
    ) -> Result<String, chartflow_core::error::CollaboratorError> {
        let started = time::Instant::now();

        let text = if document.mime_type == "application/pdf"
            || document.mime_type.starts_with("image/")
        {
            let bytes = self.collaborators.blobs.get(&document.blob_key).await?;
            let path = std::env::temp_dir().join(format!("chartflow-doc-{}", document.id));
            tokio::fs::write(&path, &bytes)
                .await
                .map_err(|error| chartflow_core::error::CollaboratorError::BlobIo(error.to_string()))?;
            let result = self.collaborators.ocr.extract(Path::new(&path)).await;
            let _ = tokio::fs::remove_file(&path).await;
            result?.text
        } else if document.mime_type == "text/plain" {
            let bytes = self.collaborators.blobs.get(&document.blob_key).await?;
            String::from_utf8_lossy(&bytes).into_owned()
        } else if document.mime_type == "application/msword"
            || document.mime_type
                == "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        {
            let bytes = self.collaborators.blobs.get(&document.blob_key).await?;
            self.collaborators.docx.extract_text(&bytes)?
        } else {
            return Err(chartflow_core::error::CollaboratorError::ExtractionFailed(format!(
                "unsupported mime type: {}",
                document.mime_type
            )));
        };

        let elapsed_ms = started.elapsed().as_millis() as i64;
        self.documents
            .mark_extracted(document.id, &text, elapsed_ms)
            .await
            .map_err(|error| {
                chartflow_core::error::CollaboratorError::ExtractionFailed(error.to_string())
            })?;

        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use bytes::Bytes;
    use chartflow_core::chart::ChartStore;
    use chartflow_core::collaborators::{
        BlobLocation, CodingResponse, OcrResult,
    };
    use chartflow_core::documents::DocumentRepository;
    use chartflow_core::models::{AiStatus, ChartMetadata, NewDocument};
    use health::HealthRegistry;
    use sqlx::PgPool;
    use uuid::Uuid;

    use super::*;

    struct FakeBlobStore {
        content: Bytes,
    }

    #[async_trait]
    impl BlobStore for FakeBlobStore {
        async fn get(&self, _key: &str) -> Result<Bytes, chartflow_core::error::CollaboratorError> {
            Ok(self.content.clone())
        }

        async fn put(
            &self,
            key: &str,
            _content_type: &str,
            _bytes: Bytes,
        ) -> Result<BlobLocation, chartflow_core::error::CollaboratorError> {
            Ok(BlobLocation {
                key: key.to_owned(),
                url: format!("fake://{key}"),
                bucket: "fake".to_owned(),
            })
        }

        async fn presigned_url(&self, key: &str) -> Result<String, chartflow_core::error::CollaboratorError> {
            Ok(format!("fake://{key}"))
        }
    }

    struct FakeOcrService;

    #[async_trait]
    impl OcrService for FakeOcrService {
        async fn extract(&self, _file_path: &Path) -> Result<OcrResult, chartflow_core::error::CollaboratorError> {
            Ok(OcrResult {
                text: "ocr extracted text".to_owned(),
                elapsed: time::Duration::from_millis(1),
            })
        }
    }

    struct FakeLlmService {
        coding_response: CodingResponse,
    }

    #[async_trait]
    impl LlmService for FakeLlmService {
        async fn synthesize_codes(
            &self,
            _request: CodingRequest,
        ) -> Result<CodingResponse, chartflow_core::error::CollaboratorError> {
            Ok(self.coding_response.clone())
        }

        async fn summarize_document(
            &self,
            request: SummaryRequest,
        ) -> Result<String, chartflow_core::error::CollaboratorError> {
            Ok(format!("summary of document {}", request.document_id))
        }
    }

    struct FakeDocxExtractor;

    impl DocxExtractor for FakeDocxExtractor {
        fn extract_text(&self, _bytes: &[u8]) -> Result<String, chartflow_core::error::CollaboratorError> {
            Ok("docx extracted text".to_owned())
        }
    }

    async fn worker_with(
        pool: PgPool,
        coding_response: CodingResponse,
    ) -> (ChartWorker, Arc<ChartStore>, Arc<DocumentRepository>, i64) {
        let queue = Arc::new(QueueStore::from_pool(pool.clone()));
        let charts = Arc::new(ChartStore::from_pool(pool.clone()));
        let documents = Arc::new(DocumentRepository::from_pool(pool));

        let chart = charts
            .create_queued("session-pipeline", "CHT-PIPE", &ChartMetadata::default(), 0)
            .await
            .expect("create_queued failed");

        let liveness = HealthRegistry::new("liveness")
            .register("worker-test".to_owned(), ::time::Duration::seconds(60))
            .await;

        let collaborators = Collaborators {
            ocr: Arc::new(FakeOcrService),
            llm: Arc::new(FakeLlmService { coding_response }),
            blobs: Arc::new(FakeBlobStore {
                content: Bytes::from_static(b"hello world"),
            }),
            docx: Arc::new(FakeDocxExtractor),
        };

        let worker = ChartWorker::new(
            "worker-test".to_owned(),
            queue,
            charts.clone(),
            documents.clone(),
            collaborators,
            time::Duration::from_millis(10),
            liveness,
        );

        (worker, charts, documents, chart.id)
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn partial_extraction_failure_still_completes_the_job(db: PgPool) {
        let coding_response = CodingResponse {
            ok: true,
            data: Some(serde_json::json!({"codes": ["A01"]})),
        };
        let (worker, charts, documents, chart_id) = worker_with(db, coding_response).await;

        documents
            .create(&NewDocument {
                chart_id,
                mime_type: "text/plain".to_owned(),
                size_bytes: 11,
                blob_key: "doc-1".to_owned(),
                blob_url: "fake://doc-1".to_owned(),
                blob_bucket: "fake".to_owned(),
                transaction_id: Uuid::new_v4(),
                transaction_label: None,
                is_group_member: false,
            })
            .await
            .expect("create document failed");
        documents
            .create(&NewDocument {
                chart_id,
                mime_type: "application/octet-stream".to_owned(),
                size_bytes: 11,
                blob_key: "doc-2".to_owned(),
                blob_url: "fake://doc-2".to_owned(),
                blob_bucket: "fake".to_owned(),
                transaction_id: Uuid::new_v4(),
                transaction_label: None,
                is_group_member: false,
            })
            .await
            .expect("create document failed");

        let job = worker
            .queue
            .enqueue(
                chart_id,
                "CHT-PIPE",
                &chartflow_core::models::JobData {
                    chart_id,
                    chart_number: "CHT-PIPE".to_owned(),
                    session_id: Some("session-pipeline".to_owned()),
                    documents: vec![],
                },
                3,
            )
            .await
            .expect("enqueue failed");
        let claimed = worker
            .queue
            .claim_next("worker-test")
            .await
            .expect("claim failed")
            .expect("expected a job");
        assert_eq!(claimed.id, job);

        worker.process(claimed).await;

        let chart = charts
            .get_by_chart_number("CHT-PIPE")
            .await
            .expect("get_by_chart_number failed")
            .expect("chart should exist");
        assert_eq!(chart.ai_status, AiStatus::Ready);

        let (_pending, completed, failed) = documents
            .status_counts(chart_id)
            .await
            .expect("status_counts failed");
        assert_eq!(completed, 1);
        assert_eq!(failed, 1);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn missing_coding_data_fails_the_job(db: PgPool) {
        let coding_response = CodingResponse {
            ok: false,
            data: None,
        };
        let (worker, charts, documents, chart_id) = worker_with(db, coding_response).await;

        documents
            .create(&NewDocument {
                chart_id,
                mime_type: "text/plain".to_owned(),
                size_bytes: 11,
                blob_key: "doc-1".to_owned(),
                blob_url: "fake://doc-1".to_owned(),
                blob_bucket: "fake".to_owned(),
                transaction_id: Uuid::new_v4(),
                transaction_label: None,
                is_group_member: false,
            })
            .await
            .expect("create document failed");

        let job = worker
            .queue
            .enqueue(
                chart_id,
                "CHT-PIPE",
                &chartflow_core::models::JobData {
                    chart_id,
                    chart_number: "CHT-PIPE".to_owned(),
                    session_id: Some("session-pipeline".to_owned()),
                    documents: vec![],
                },
                3,
            )
            .await
            .expect("enqueue failed");
        let claimed = worker
            .queue
            .claim_next("worker-test")
            .await
            .expect("claim failed")
            .expect("expected a job");
        assert_eq!(claimed.id, job);

        worker.process(claimed).await;

        let chart = charts
            .get_by_chart_number("CHT-PIPE")
            .await
            .expect("get_by_chart_number failed")
            .expect("chart should exist");
        assert_eq!(chart.ai_status, AiStatus::RetryPending);
        assert!(chart.last_error.is_some());
    }
}
