//! A dedicated `LISTEN` connection translating Postgres notifications into
//! WebSocket fan-out via the in-memory `ConnectionRegistry`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chartflow_core::notify::{ChartStatusEvent, JobStatusEvent, CHART_STATUS_CHANNEL, JOB_STATUS_CHANNEL};
use sqlx::postgres::PgListener;
use tracing::{error, info, warn};

use crate::protocol::ServerFrame;
use crate::registry::ConnectionRegistry;

pub struct PgNotificationBridge {
    database_url: String,
    registry: Arc<ConnectionRegistry>,
    reconnecting: AtomicBool,
    reconnect_delay: Duration,
    keepalive_interval: Duration,
}

impl PgNotificationBridge {
    pub fn new(
        database_url: String,
        registry: Arc<ConnectionRegistry>,
        reconnect_delay: Duration,
        keepalive_interval: Duration,
    ) -> Self {
        Self {
            database_url,
            registry,
            reconnecting: AtomicBool::new(false),
            reconnect_delay,
            keepalive_interval,
        }
    }

    /// Connect, subscribe to both channels, and process notifications until
    /// the connection errors, then reconnect after `reconnect_delay`.
    pub async fn run(self: Arc<Self>) {
        loop {
            match self.connect_and_listen().await {
                Ok(()) => warn!("pg listener connection closed cleanly, reconnecting"),
                Err(error) => error!(error = %error, "pg listener connection error, reconnecting"),
            }
            self.reconnect_with_guard().await;
        }
    }

    async fn reconnect_with_guard(&self) {
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        tokio::time::sleep(self.reconnect_delay).await;
        self.reconnecting.store(false, Ordering::SeqCst);
    }

    async fn connect_and_listen(&self) -> Result<(), sqlx::Error> {
        let mut listener = PgListener::connect(&self.database_url).await?;
        listener
            .listen_all([JOB_STATUS_CHANNEL, CHART_STATUS_CHANNEL])
            .await?;
        info!("pg listener connected and subscribed");

        let mut keepalive = tokio::time::interval(self.keepalive_interval);

        loop {
            tokio::select! {
                notification = listener.recv() => {
                    let notification = notification?;
                    self.handle_notification(notification.channel(), notification.payload());
                }
                _ = keepalive.tick() => {
                    sqlx::query("SELECT 1").execute(&mut listener).await?;
                }
            }
        }
    }

    fn handle_notification(&self, channel: &str, payload: &str) {
        if channel == JOB_STATUS_CHANNEL {
            match serde_json::from_str::<JobStatusEvent>(payload) {
                Ok(event) => {
                    let frame = ServerFrame::StatusUpdate {
                        job_id: event.job_id,
                        status: event.status,
                        phase: event.phase,
                        message: event.message,
                        timestamp: event.timestamp,
                    };
                    self.registry.broadcast_job_status(event.job_id, &frame);
                }
                Err(error) => warn!(error = %error, "failed to parse job status payload"),
            }
        } else if channel == CHART_STATUS_CHANNEL {
            match serde_json::from_str::<ChartStatusEvent>(payload) {
                Ok(event) => {
                    let frame = ServerFrame::ChartStatusUpdate {
                        session_id: event.session_id.clone(),
                        ai_status: event.ai_status,
                        timestamp: event.timestamp,
                    };
                    self.registry.broadcast_chart_status(&event.session_id, &frame);
                }
                Err(error) => warn!(error = %error, "failed to parse chart status payload"),
            }
        }
    }
}
