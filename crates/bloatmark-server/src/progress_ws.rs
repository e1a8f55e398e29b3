//! WebSocket fan-out of orchestrator progress events.
//!
//! Endpoint: GET /ws/progress
//!
//! Observers (the browser UI, operator tooling) connect here to watch
//! tests move through their phases:
//! - test.started / test.phase / test.completed / test.aborted

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::sink::SinkExt;
use futures::stream::StreamExt;

use crate::state::AppState;

/// Axum handler — upgrades HTTP to WebSocket.
pub async fn handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

/// Subscribes to the broadcast channel and pushes every event to the
/// client. A subscriber that cannot keep up is allowed to lag and lose
/// events rather than slow the orchestrator.
async fn handle_socket(state: AppState, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let mut progress_rx = state.subscribe_progress();

    tracing::debug!("progress subscriber connected");

    loop {
        tokio::select! {
            event = progress_rx.recv() => {
                match event {
                    Ok(event) => {
                        let json = match serde_json::to_string(&event) {
                            Ok(j) => j,
                            Err(_) => continue,
                        };
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("progress subscriber lagged, dropped {n} events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {} // nothing to say to observers
                }
            }
        }
    }

    tracing::debug!("progress subscriber disconnected");
}
