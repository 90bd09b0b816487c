//! The `/api/ws` WebSocket surface: subscribe/unsubscribe frames in,
//! forwarded status events out, pinged every 30 s.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use chrono::Utc;
use chartflow_core::queue::QueueStore;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::protocol::{ClientFrame, ServerFrame};
use crate::registry::ConnectionRegistry;

#[derive(Clone)]
pub struct WsState {
    pub registry: Arc<ConnectionRegistry>,
    pub queue: Arc<QueueStore>,
    pub ping_interval: Duration,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<WsState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: WsState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let connection = state.registry.register(tx);
    info!(connection = %connection, "websocket connected");

    let awaiting_pong = Arc::new(AtomicBool::new(false));
    let mut ping_interval = tokio::time::interval(state.ping_interval);
    // First tick fires immediately; consume it so the first real ping waits a full interval.
    ping_interval.tick().await;

    loop {
        tokio::select! {
            outgoing = rx.recv() => {
                match outgoing {
                    Some(message) => {
                        if sink.send(message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_frame(&state, connection, &text).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        awaiting_pong.store(false, Ordering::SeqCst);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        warn!(connection = %connection, error = %error, "websocket read error");
                        break;
                    }
                }
            }
            _ = ping_interval.tick() => {
                if awaiting_pong.swap(true, Ordering::SeqCst) {
                    info!(connection = %connection, "missed pong, closing connection");
                    break;
                }
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.registry.remove(connection);
    info!(connection = %connection, "websocket disconnected");
}

async fn handle_client_frame(state: &WsState, connection: crate::registry::ConnectionId, text: &str) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(error) => {
            state.registry.send_to(
                connection,
                &ServerFrame::Error {
                    message: format!("malformed frame: {error}"),
                },
            );
            return;
        }
    };

    match frame {
        ClientFrame::Subscribe { job_id } => {
            state.registry.subscribe_job(connection, job_id);
            state.registry.send_to(
                connection,
                &ServerFrame::Subscribed {
                    job_id,
                    timestamp: Utc::now(),
                },
            );
            send_initial_job_state(state, connection, job_id).await;
        }
        ClientFrame::Unsubscribe { job_id } => {
            state.registry.unsubscribe_job(connection, job_id);
            state.registry.send_to(
                connection,
                &ServerFrame::Unsubscribed {
                    job_id,
                    timestamp: Utc::now(),
                },
            );
        }
        ClientFrame::SubscribeCharts { session_ids } => {
            state.registry.subscribe_charts(connection, &session_ids);
            state.registry.send_to(
                connection,
                &ServerFrame::ChartsSubscribed {
                    session_ids,
                    timestamp: Utc::now(),
                },
            );
        }
        ClientFrame::UnsubscribeCharts => {
            state.registry.unsubscribe_all_charts(connection);
            state.registry.send_to(
                connection,
                &ServerFrame::ChartsUnsubscribed {
                    timestamp: Utc::now(),
                },
            );
        }
    }
}

/// On initial subscription, send the job's current state immediately so
/// late subscribers are not blind to work that already happened.
async fn send_initial_job_state(state: &WsState, connection: crate::registry::ConnectionId, job_id: i64) {
    match state.queue.get_job(job_id).await {
        Ok(Some(job)) => {
            let status = format!("{:?}", job.status).to_lowercase();
            state.registry.send_to(
                connection,
                &ServerFrame::StatusUpdate {
                    job_id,
                    status,
                    phase: "current".to_owned(),
                    message: job.error_message.unwrap_or_default(),
                    timestamp: Utc::now(),
                },
            );
        }
        Ok(None) => {}
        Err(error) => warn!(job_id, error = %error, "failed to fetch initial job state"),
    }
}
