//! The Notification Bus: one dedicated `LISTEN` connection fed into
//! in-memory subscription maps, fanned out over `/api/ws`.

use std::future::ready;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use chartflow_core::metrics::setup_metrics_router;
use chartflow_core::queue::QueueStore;
use chartflow_core::HealthRegistry;
use envconfig::Envconfig;

mod config;
mod error;
mod pg_listener;
mod protocol;
mod registry;
mod ws;

use config::Config;
use error::ListenerError;
use pg_listener::PgNotificationBridge;
use registry::ConnectionRegistry;
use ws::{ws_handler, WsState};

#[tokio::main]
async fn main() -> Result<(), ListenerError> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env().expect("invalid configuration");

    let liveness_registry = HealthRegistry::new("liveness");
    let liveness = liveness_registry
        .register("listener".to_string(), ::time::Duration::seconds(120))
        .await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;
    let queue = Arc::new(QueueStore::from_pool(pool));

    let registry = Arc::new(ConnectionRegistry::new());

    let bridge = Arc::new(PgNotificationBridge::new(
        config.database_url.clone(),
        registry.clone(),
        Duration::from_millis(config.pg_reconnect_delay_ms),
        Duration::from_millis(config.pg_keepalive_interval_ms),
    ));
    tokio::spawn({
        let bridge = bridge.clone();
        async move {
            bridge.run().await;
        }
    });

    tokio::spawn(async move {
        loop {
            liveness.report_healthy().await;
            tokio::time::sleep(Duration::from_secs(20)).await;
        }
    });

    let ws_state = WsState {
        registry,
        queue,
        ping_interval: Duration::from_millis(config.ws_ping_interval_ms),
    };

    let router = Router::new()
        .route("/api/ws", get(ws_handler))
        .with_state(ws_state)
        .route("/_readiness", get(index))
        .route(
            "/_liveness",
            get(move || ready(liveness_registry.get_status())),
        )
        .merge(setup_metrics_router());

    let listener = tokio::net::TcpListener::bind(config.bind()).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

pub async fn index() -> &'static str {
    "chartflow listener"
}
