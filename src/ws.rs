use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::handlers::AppState;
use crate::progress::ProgressEvent;
use crate::tasks::TaskInfo;

#[derive(Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    pub evaluation_id: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> Response {
    ws.on_upgrade(move |socket| handle_ws(socket, state, query.evaluation_id))
}

fn wanted(filter: &Option<String>, evaluation_id: &str) -> bool {
    filter.as_deref().map_or(true, |f| f == evaluation_id)
}

fn snapshot(tasks: Vec<TaskInfo>, filter: &Option<String>) -> serde_json::Value {
    let tasks: Vec<TaskInfo> = tasks
        .into_iter()
        .filter(|t| wanted(filter, &t.evaluation_id.to_string()))
        .collect();
    serde_json::json!({
        "event": "snapshot",
        "evaluation_id": filter,
        "data": { "evaluations": tasks },
    })
}

async fn handle_ws(socket: WebSocket, state: Arc<AppState>, filter: Option<String>) {
    let mut rx: broadcast::Receiver<ProgressEvent> = state.progress.subscribe();
    let (mut sender, mut receiver) = socket.split();

    info!(evaluation_id = ?filter, "WebSocket connected");

    let snapshot_json =
        serde_json::to_string(&snapshot(state.orchestrator.get_active_evaluations(), &filter))
            .unwrap_or_default();
    if sender.send(Message::Text(snapshot_json)).await.is_err() {
        return;
    }

    let send_filter = filter.clone();
    let send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if !wanted(&send_filter, &event.evaluation_id) {
                        continue;
                    }
                    let json = match serde_json::to_string(&serde_json::json!({
                        "event": "progress",
                        "data": event,
                    })) {
                        Ok(j) => j,
                        Err(_) => continue,
                    };
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("WebSocket lagged by {} progress events", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    let close_json = serde_json::to_string(&serde_json::json!({
                        "event": "stream_closed",
                        "evaluation_id": send_filter,
                    }))
                    .unwrap_or_default();
                    let _ = sender.send(Message::Text(close_json)).await;
                    break;
                }
            }
        }
    });

    let recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    warn!("WebSocket receive error: {}", e);
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    info!(evaluation_id = ?filter, "WebSocket disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EvaluationSpec;
    use crate::tasks::TaskTracker;
    use std::time::Duration;

    #[test]
    fn test_filter_matching() {
        assert!(wanted(&None, "anything"));
        assert!(wanted(&Some("a".into()), "a"));
        assert!(!wanted(&Some("a".into()), "b"));
    }

    #[test]
    fn test_snapshot_filters_evaluations() {
        let tracker = TaskTracker::new(Duration::from_secs(60));
        let spec = |name: &str| -> EvaluationSpec {
            serde_json::from_value(serde_json::json!({
                "name": name,
                "model_name": "m",
                "model_url": "http://m",
                "backends": []
            }))
            .unwrap()
        };
        let a = spec("a");
        let b = spec("b");
        tracker.start(&a);
        tracker.start(&b);

        let all = snapshot(tracker.list(), &None);
        assert_eq!(all["data"]["evaluations"].as_array().unwrap().len(), 2);

        let one = snapshot(tracker.list(), &Some(a.id.to_string()));
        let list = one["data"]["evaluations"].as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["name"], "a");
        assert_eq!(one["event"], "snapshot");
    }
}
