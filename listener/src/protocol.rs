//! Wire protocol for the `/api/ws` WebSocket surface: text JSON frames in
//! both directions, tagged by a snake_case `type` field with camelCase
//! payload fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    Subscribe { job_id: i64 },
    Unsubscribe { job_id: i64 },
    SubscribeCharts { session_ids: Vec<String> },
    UnsubscribeCharts,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    Subscribed {
        job_id: i64,
        timestamp: DateTime<Utc>,
    },
    Unsubscribed {
        job_id: i64,
        timestamp: DateTime<Utc>,
    },
    ChartsSubscribed {
        session_ids: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    ChartsUnsubscribed {
        timestamp: DateTime<Utc>,
    },
    StatusUpdate {
        job_id: i64,
        status: String,
        phase: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    ChartStatusUpdate {
        session_id: String,
        ai_status: String,
        timestamp: DateTime<Utc>,
    },
    Error {
        message: String,
    },
}

impl ServerFrame {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","message":"failed to serialize frame"}"#.to_owned()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subscribe_frame() {
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"subscribe","jobId":42}"#)
            .expect("should parse");
        match frame {
            ClientFrame::Subscribe { job_id } => assert_eq!(job_id, 42),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn parses_subscribe_charts_frame() {
        let frame: ClientFrame = serde_json::from_str(
            r#"{"type":"subscribe_charts","sessionIds":["a","b"]}"#,
        )
        .expect("should parse");
        match frame {
            ClientFrame::SubscribeCharts { session_ids } => {
                assert_eq!(session_ids, vec!["a".to_owned(), "b".to_owned()])
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn serializes_status_update_with_type_tag_and_camel_case_fields() {
        use assert_json_diff::assert_json_include;

        let frame = ServerFrame::StatusUpdate {
            job_id: 1,
            status: "processing".to_owned(),
            phase: "claimed".to_owned(),
            message: "claimed by worker-1".to_owned(),
            timestamp: Utc::now(),
        };
        let actual: serde_json::Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_json_include!(
            actual: actual,
            expected: serde_json::json!({
                "type": "status_update",
                "jobId": 1,
                "status": "processing",
            })
        );
    }

    #[test]
    fn serializes_chart_status_update_with_camel_case_fields() {
        use assert_json_diff::assert_json_include;

        let frame = ServerFrame::ChartStatusUpdate {
            session_id: "session-1".to_owned(),
            ai_status: "retry_pending".to_owned(),
            timestamp: Utc::now(),
        };
        let actual: serde_json::Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_json_include!(
            actual: actual,
            expected: serde_json::json!({
                "type": "chart_status_update",
                "sessionId": "session-1",
                "aiStatus": "retry_pending",
            })
        );
    }
}
