use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use joda_session::{SessionEvent, SessionSnapshot};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::state::AppState;

/// First frame on every socket, so clients start from a full picture.
#[derive(Serialize)]
#[serde(tag = "type", rename = "session:snapshot")]
struct SnapshotFrame {
    snapshot: SessionSnapshot,
}

/// `GET /ws`: stream session events as JSON text frames.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    // Subscribe before taking the snapshot so no event falls in between.
    let rx = state.session.subscribe();
    let snapshot = state.session.snapshot();
    ws.on_upgrade(move |socket| handle_socket(socket, snapshot, rx))
}

async fn send_json<T: Serialize>(socket: &mut WebSocket, value: &T) -> bool {
    match serde_json::to_string(value) {
        Ok(text) => socket.send(Message::Text(text.into())).await.is_ok(),
        Err(e) => {
            tracing::warn!(error = %e, "failed to serialize websocket frame");
            true
        }
    }
}

async fn handle_socket(
    mut socket: WebSocket,
    snapshot: SessionSnapshot,
    mut rx: broadcast::Receiver<SessionEvent>,
) {
    tracing::info!("WebSocket client connected");

    if !send_json(&mut socket, &SnapshotFrame { snapshot }).await {
        return;
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if !send_json(&mut socket, &event).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "WebSocket client lagged, skipping events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    tracing::info!("WebSocket client disconnected");
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/ws", get(ws_handler))
}
