//! Claims jobs from `processing_queue` and drives the OCR -> LLM -> persist
//! pipeline for each, serving `/metrics` and `/_liveness` alongside the loop.

use std::future::ready;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use chartflow_core::chart::ChartStore;
use chartflow_core::collaborators::http::{
    HttpBlobStore, ReqwestLlmService, ReqwestOcrService, WordXmlExtractor,
};
use chartflow_core::documents::DocumentRepository;
use chartflow_core::metrics::{serve, setup_metrics_router};
use chartflow_core::queue::QueueStore;
use chartflow_core::HealthRegistry;
use envconfig::Envconfig;

use chartflow_worker::config::Config;
use chartflow_worker::error::WorkerError;
use chartflow_worker::worker::{ChartWorker, Collaborators};

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env().expect("invalid configuration");

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness
        .register("worker".to_string(), ::time::Duration::seconds(60))
        .await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.max_pg_connections)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to database");

    let queue = Arc::new(QueueStore::from_pool(pool.clone()));
    let charts = Arc::new(ChartStore::from_pool(pool.clone()));
    let documents = Arc::new(DocumentRepository::from_pool(pool));

    queue
        .release_stuck(config.stuck_lease_minutes)
        .await
        .expect("failed to release stuck leases on startup");

    let http_client = reqwest::Client::builder()
        .timeout(config.request_timeout.0)
        .user_agent("chartflow-worker")
        .build()
        .expect("failed to build reqwest client");

    let collaborators = Collaborators {
        ocr: Arc::new(ReqwestOcrService::new(
            http_client.clone(),
            config.ocr_service_url.clone(),
        )),
        llm: Arc::new(ReqwestLlmService::new(
            http_client.clone(),
            config.llm_service_url.clone(),
            config.llm_api_key.clone(),
            config.llm_model.clone(),
        )),
        blobs: Arc::new(HttpBlobStore::new(
            http_client,
            config.blob_store_endpoint.clone(),
            config.blob_store_bucket.clone(),
        )),
        docx: Arc::new(WordXmlExtractor),
    };

    let worker_id = format!(
        "worker-{}-{}",
        hostname(),
        std::process::id()
    );

    let worker = ChartWorker::new(
        worker_id,
        queue,
        charts,
        documents,
        collaborators,
        config.poll_interval.0,
        worker_liveness,
    );
    worker.install_shutdown_handlers();

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())))
        .merge(setup_metrics_router());
    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    worker.run().await;

    Ok(())
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_owned())
}

pub async fn index() -> &'static str {
    "chartflow worker"
}
