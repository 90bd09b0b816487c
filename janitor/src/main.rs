//! Runs `release_stuck` and `cleanup` against the processing queue on a
//! fixed interval, and serves a small health/metrics endpoint alongside.

use std::future::ready;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use chartflow_core::metrics::setup_metrics_router;
use chartflow_core::queue::QueueStore;
use chartflow_core::HealthRegistry;
use envconfig::Envconfig;
use futures::future::{select, Either};
use tokio::sync::Semaphore;
use tracing::{error, info};

mod config;
mod error;

use config::Config;
use error::JanitorError;

async fn listen(app: Router, bind: String) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app).await
}

/// Run `release_stuck` then `cleanup` on every tick, guarded by a
/// single-permit semaphore so a slow pass never overlaps the next tick.
async fn maintenance_loop(
    queue: QueueStore,
    interval_secs: u64,
    stuck_lease_minutes: i64,
    job_retention_days: i64,
    liveness: health::HealthHandle,
) {
    let semaphore = Semaphore::new(1);
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;
        let _permit = semaphore.acquire().await;
        liveness.report_healthy().await;

        match queue.release_stuck(stuck_lease_minutes).await {
            Ok(count) if count > 0 => info!(count, "released stuck leases"),
            Ok(_) => {}
            Err(error) => error!(error = %error, "failed to release stuck leases"),
        }

        match queue.cleanup(job_retention_days).await {
            Ok(count) if count > 0 => info!(count, "cleaned up completed jobs"),
            Ok(_) => {}
            Err(error) => error!(error = %error, "failed to clean up completed jobs"),
        }

        drop(_permit);
    }
}

#[tokio::main]
async fn main() -> Result<(), JanitorError> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env().expect("invalid configuration");

    let liveness_registry = HealthRegistry::new("liveness");
    let liveness = liveness_registry
        .register("janitor".to_string(), ::time::Duration::seconds(300))
        .await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.max_pg_connections)
        .connect(&config.database_url)
        .await?;
    let queue = QueueStore::from_pool(pool);

    let maintenance = Box::pin(maintenance_loop(
        queue,
        config.cleanup_interval_secs,
        config.stuck_lease_minutes,
        config.job_retention_days,
        liveness,
    ));

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route(
            "/_liveness",
            get(move || ready(liveness_registry.get_status())),
        )
        .merge(setup_metrics_router());
    let http_server = Box::pin(listen(router, config.bind()));

    match select(http_server, maintenance).await {
        Either::Left((result, _)) => {
            if let Err(error) = result {
                error!(error = %error, "janitor http server exited");
            }
        }
        Either::Right(((), _)) => {
            error!("janitor maintenance loop exited unexpectedly");
        }
    }

    Ok(())
}

pub async fn index() -> &'static str {
    "chartflow janitor"
}
