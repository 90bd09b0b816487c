//! In-memory subscription maps fanning out notifications to connected
//! WebSocket clients. `DashMap`'s internal sharding is the synchronization
//! primitive here -- there is deliberately no outer mutex.

use std::collections::HashSet;

use axum::extract::ws::Message;
use dashmap::DashMap;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::protocol::ServerFrame;

pub type ConnectionId = Uuid;

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, UnboundedSender<Message>>,
    job_subscriptions: DashMap<i64, HashSet<ConnectionId>>,
    chart_subscriptions: DashMap<String, HashSet<ConnectionId>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, sender: UnboundedSender<Message>) -> ConnectionId {
        let id = Uuid::new_v4();
        self.connections.insert(id, sender);
        id
    }

    /// Remove a connection and every subscription it held.
    pub fn remove(&self, connection: ConnectionId) {
        self.connections.remove(&connection);
        self.job_subscriptions.retain(|_, subscribers| {
            subscribers.remove(&connection);
            !subscribers.is_empty()
        });
        self.chart_subscriptions.retain(|_, subscribers| {
            subscribers.remove(&connection);
            !subscribers.is_empty()
        });
    }

    pub fn subscribe_job(&self, connection: ConnectionId, job_id: i64) {
        self.job_subscriptions
            .entry(job_id)
            .or_default()
            .insert(connection);
    }

    pub fn unsubscribe_job(&self, connection: ConnectionId, job_id: i64) {
        if let Some(mut subscribers) = self.job_subscriptions.get_mut(&job_id) {
            subscribers.remove(&connection);
        }
    }

    pub fn subscribe_charts(&self, connection: ConnectionId, session_ids: &[String]) {
        for session_id in session_ids {
            self.chart_subscriptions
                .entry(session_id.clone())
                .or_default()
                .insert(connection);
        }
    }

    /// Remove `connection` from every chart subscription it holds (the
    /// protocol's `unsubscribe_charts` has no session-id argument).
    pub fn unsubscribe_all_charts(&self, connection: ConnectionId) {
        self.chart_subscriptions.retain(|_, subscribers| {
            subscribers.remove(&connection);
            !subscribers.is_empty()
        });
    }

    /// Send `frame` to a single connection. Silently drops if the
    /// connection has since disconnected.
    pub fn send_to(&self, connection: ConnectionId, frame: &ServerFrame) {
        if let Some(sender) = self.connections.get(&connection) {
            let _ = sender.send(Message::Text(frame.to_json().into()));
        }
    }

    /// Fan a job status event out to every subscriber of `job_id`.
    pub fn broadcast_job_status(&self, job_id: i64, frame: &ServerFrame) {
        if let Some(subscribers) = self.job_subscriptions.get(&job_id) {
            let payload = frame.to_json();
            for connection in subscribers.iter() {
                if let Some(sender) = self.connections.get(connection) {
                    let _ = sender.send(Message::Text(payload.clone().into()));
                }
            }
        }
    }

    /// Fan a chart status event out to every subscriber of `session_id`.
    /// This is also the same-process fast path: callers in the worker
    /// process can invoke this directly, bypassing the database, when the
    /// listener and the event source share a process.
    pub fn broadcast_chart_status(&self, session_id: &str, frame: &ServerFrame) {
        if let Some(subscribers) = self.chart_subscriptions.get(session_id) {
            let payload = frame.to_json();
            for connection in subscribers.iter() {
                if let Some(sender) = self.connections.get(connection) {
                    let _ = sender.send(Message::Text(payload.clone().into()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn subscribe_then_remove_cleans_up() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let connection = registry.register(tx);

        registry.subscribe_job(connection, 1);
        assert!(registry.job_subscriptions.contains_key(&1));

        registry.remove(connection);
        assert!(!registry.job_subscriptions.contains_key(&1));
    }

    #[test]
    fn unsubscribe_all_charts_removes_every_membership() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let connection = registry.register(tx);

        registry.subscribe_charts(connection, &["a".to_owned(), "b".to_owned()]);
        assert!(registry.chart_subscriptions.contains_key("a"));
        assert!(registry.chart_subscriptions.contains_key("b"));

        registry.unsubscribe_all_charts(connection);
        assert!(!registry.chart_subscriptions.contains_key("a"));
        assert!(!registry.chart_subscriptions.contains_key("b"));
    }
}
