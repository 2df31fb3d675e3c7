//! WebSocket stream for UI clients.
//!
//! On connect the client gets a `sessions_list` snapshot, then every store
//! broadcast. Text frames carrying a `ClientMessage` are dispatched; their
//! result arrives as the `action_completed` broadcast.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use panedock_protocol::{ClientMessage, ServerMessage};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;
use crate::http::AppState;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

const OUTBOUND_CAPACITY: usize = 100;

enum OutboundMessage {
    Json(ServerMessage),
    Pong(Bytes),
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    info!(
        component = "websocket",
        event = "ws.connection.opened",
        connection_id = conn_id,
        "WebSocket connection opened"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundMessage>(OUTBOUND_CAPACITY);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let result = match msg {
                OutboundMessage::Json(server_msg) => match serde_json::to_string(&server_msg) {
                    Ok(json) => ws_tx.send(Message::Text(json.into())).await,
                    Err(err) => {
                        warn!(
                            component = "websocket",
                            event = "ws.send.serialize_failed",
                            connection_id = conn_id,
                            error = %err,
                            "Failed to serialize server message"
                        );
                        continue;
                    }
                },
                OutboundMessage::Pong(data) => ws_tx.send(Message::Pong(data)).await,
            };
            if result.is_err() {
                debug!(
                    component = "websocket",
                    event = "ws.send.disconnected",
                    connection_id = conn_id,
                    "WebSocket send failed, client disconnected"
                );
                break;
            }
        }
    });

    // subscribe before taking the snapshot so nothing falls between the two
    let updates = state.store.subscribe();
    let initial = ServerMessage::SessionsList {
        sessions: state.store.snapshot().to_list(),
    };
    let _ = outbound_tx.send(OutboundMessage::Json(initial)).await;
    spawn_broadcast_forwarder(updates, outbound_tx.clone());

    while let Some(result) = ws_rx.next().await {
        let text = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Ping(data)) => {
                let _ = outbound_tx.send(OutboundMessage::Pong(data)).await;
                continue;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                warn!(
                    component = "websocket",
                    event = "ws.connection.error",
                    connection_id = conn_id,
                    error = %err,
                    "WebSocket error"
                );
                break;
            }
        };
        handle_text(text.as_str(), &state.dispatcher, &outbound_tx, conn_id).await;
    }

    info!(
        component = "websocket",
        event = "ws.connection.closed",
        connection_id = conn_id,
        "WebSocket connection closed"
    );
    send_task.abort();
}

async fn handle_text(
    text: &str,
    dispatcher: &Arc<Dispatcher>,
    outbound_tx: &mpsc::Sender<OutboundMessage>,
    conn_id: u64,
) {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(err) => {
            warn!(
                component = "websocket",
                event = "ws.message.parse_failed",
                connection_id = conn_id,
                error = %err,
                payload_bytes = text.len(),
                "Failed to parse client message"
            );
            let _ = outbound_tx
                .send(OutboundMessage::Json(ServerMessage::Error {
                    code: "parse_error".into(),
                    message: err.to_string(),
                }))
                .await;
            return;
        }
    };

    // pane delivery sleeps between keystrokes; keep reading meanwhile
    let dispatcher = dispatcher.clone();
    tokio::spawn(async move {
        dispatcher.dispatch(message).await;
    });
}

/// Drains a store subscription into one client's outbound queue. Exits once
/// the client is gone.
fn spawn_broadcast_forwarder(
    mut rx: broadcast::Receiver<ServerMessage>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(msg) => {
                    if outbound_tx.send(OutboundMessage::Json(msg)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        component = "websocket",
                        event = "ws.broadcast.lagged",
                        skipped = n,
                        "Broadcast subscriber lagged, skipped {n} messages"
                    );
                    let _ = outbound_tx
                        .send(OutboundMessage::Json(ServerMessage::Error {
                            code: "lagged".into(),
                            message: format!("Subscriber lagged, skipped {n} messages"),
                        }))
                        .await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use panedock_protocol::{ActionOutcome, HookEvent};

    use super::*;
    use crate::command::testing::ScriptedRunner;
    use crate::services::testing::test_bed;
    use crate::transition::Input;

    async fn next_json(rx: &mut mpsc::Receiver<OutboundMessage>) -> ServerMessage {
        let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for outbound message")
            .expect("outbound channel closed");
        match msg {
            OutboundMessage::Json(msg) => msg,
            OutboundMessage::Pong(_) => panic!("expected json, got pong"),
        }
    }

    #[tokio::test]
    async fn forwarder_relays_updates_and_reports_lag() {
        let (tx, rx) = broadcast::channel(1);
        let (out_tx, mut out_rx) = mpsc::channel(8);

        tx.send(ServerMessage::SessionRemoved {
            session_id: "a".into(),
            reason: "stale".into(),
        })
        .unwrap();
        tx.send(ServerMessage::SessionRemoved {
            session_id: "b".into(),
            reason: "stale".into(),
        })
        .unwrap();
        spawn_broadcast_forwarder(rx, out_tx);

        match next_json(&mut out_rx).await {
            ServerMessage::Error { code, .. } => assert_eq!(code, "lagged"),
            other => panic!("expected lag error, got {other:?}"),
        }
        match next_json(&mut out_rx).await {
            ServerMessage::SessionRemoved { session_id, .. } => assert_eq!(session_id, "b"),
            other => panic!("expected removal, got {other:?}"),
        }

        drop(tx);
        let closed = tokio::time::timeout(Duration::from_secs(2), out_rx.recv())
            .await
            .unwrap();
        assert!(closed.is_none());
    }

    #[tokio::test]
    async fn bad_frames_get_a_parse_error() {
        let bed = test_bed(ScriptedRunner::new(), None);
        let dispatcher = Arc::new(Dispatcher::new(bed.store.clone(), &bed.services));
        let (out_tx, mut out_rx) = mpsc::channel(8);

        handle_text("{\"type\":\"launch\"}", &dispatcher, &out_tx, 1).await;
        match next_json(&mut out_rx).await {
            ServerMessage::Error { code, .. } => assert_eq!(code, "parse_error"),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn actions_complete_through_the_broadcast() {
        let bed = test_bed(ScriptedRunner::new(), None);
        let dispatcher = Arc::new(Dispatcher::new(bed.store.clone(), &bed.services));
        let mut updates = bed.store.subscribe();
        let (out_tx, _out_rx) = mpsc::channel(8);

        bed.store
            .sink()
            .submit(
                "s1",
                Input::Lifecycle(HookEvent {
                    session_id: "s1".into(),
                    status: Some("processing".into()),
                    ..Default::default()
                }),
            )
            .await;

        handle_text(
            r#"{"type":"approve_tool","session_id":"s1"}"#,
            &dispatcher,
            &out_tx,
            1,
        )
        .await;

        let outcome = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(ServerMessage::ActionCompleted { outcome, action, .. }) =
                    updates.recv().await
                {
                    return (action, outcome);
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(outcome.0, "approve");
        assert!(!outcome.1.ok);
        assert_ne!(outcome.1, ActionOutcome::success());
    }
}
