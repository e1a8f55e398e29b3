//! Worker discovery and the degraded-mode WebSocket proxy.
//!
//! `GET /ws/virtual-household/{persona}` normally answers a
//! direct-connect hint so the client opens its WebSocket straight to the
//! persona worker's port, bypassing the front door for the duration of
//! the test. When the worker misses its health check the hint flips to
//! `redirect:false` and the same path accepts the upgrade itself,
//! piping frames to the worker over loopback.

use std::net::SocketAddr;

use axum::extract::ws::{CloseFrame, Message as AxMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, FromRequestParts, OptionalFromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message as TgMessage;

use bloatmark_common::persona::{Persona, ALL_PERSONAS};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct DiscoveryQuery {
    #[serde(default)]
    pub test_id: Option<String>,
}

/// Thin wrapper so a missing/invalid upgrade request falls through to the
/// discovery JSON response instead of rejecting the request outright.
pub(crate) struct MaybeWebSocketUpgrade(Option<WebSocketUpgrade>);

impl<S> OptionalFromRequestParts<S> for MaybeWebSocketUpgrade
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> Result<Option<Self>, Self::Rejection> {
        let ws = WebSocketUpgrade::from_request_parts(parts, state)
            .await
            .ok();
        Ok(Some(MaybeWebSocketUpgrade(ws)))
    }
}

pub async fn virtual_household(
    State(state): State<AppState>,
    Path(persona): Path<String>,
    Query(query): Query<DiscoveryQuery>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: Option<MaybeWebSocketUpgrade>,
) -> Result<Response, ApiError> {
    let ws = ws.and_then(|w| w.0);
    let persona: Persona = persona
        .parse()
        .map_err(|_| ApiError::not_found("unknown persona"))?;

    // An upgrade request on this path is the degraded-mode client
    // arriving; everything else is a discovery query.
    if let Some(ws) = ws {
        return proxy_upgrade(state, persona, query.test_id, peer, ws);
    }

    let healthy = worker_healthy(&state, persona).await;
    let host = request_host(&headers);
    let scheme = if state.config().tls_enabled() { "wss" } else { "ws" };

    if healthy {
        let port = state.config().persona_port(persona);
        Ok(Json(serde_json::json!({
            "redirect": true,
            "websocket_url": format!("{scheme}://{host}:{port}/{persona}"),
            "port": port,
            "architecture": "multi-process",
        }))
        .into_response())
    } else {
        // Degraded mode: the client re-connects to this same path and the
        // front door relays. The worker may still come up in time; if it
        // does not, the proxy dial fails and the socket closes.
        let port = state.config().front_door_port;
        tracing::warn!(persona = %persona, "worker unhealthy, offering proxied fallback");
        Ok(Json(serde_json::json!({
            "redirect": false,
            "websocket_url": format!("{scheme}://{host}:{port}/ws/virtual-household/{persona}"),
            "port": port,
            "architecture": "multi-process",
        }))
        .into_response())
    }
}

async fn worker_healthy(state: &AppState, persona: Persona) -> bool {
    let url = format!("{}/health", state.config().worker_url(persona));
    match state.http().get(&url).send().await {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}

fn request_host(headers: &HeaderMap) -> String {
    headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|h| h.split(':').next().unwrap_or(h).to_string())
        .unwrap_or_else(|| "127.0.0.1".into())
}

// ── Degraded-mode proxy ─────────────────────────────────────────────

fn proxy_upgrade(
    state: AppState,
    persona: Persona,
    test_id: Option<String>,
    peer: SocketAddr,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let test_id = test_id.ok_or_else(|| ApiError::bad_request("test_id required"))?;

    // The worker cannot see the real client address through the relay,
    // so the origin check happens here against the orchestrator's
    // registration.
    let entry = state
        .tests()
        .get(&test_id)
        .map(|e| e.value().clone())
        .ok_or_else(|| ApiError::forbidden("unknown test id"))?;
    if entry.client_addr != peer.ip() {
        return Err(ApiError::forbidden("address does not match this test"));
    }

    Ok(ws.on_upgrade(move |socket| proxy_socket(state, persona, test_id, socket)))
}

async fn proxy_socket(state: AppState, persona: Persona, test_id: String, client: WebSocket) {
    let port = state.config().persona_port(persona);
    let url = format!("ws://127.0.0.1:{port}/{persona}?test_id={test_id}");

    let worker = match tokio_tungstenite::connect_async(&url).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            tracing::warn!(persona = %persona, error = %e, "proxy dial failed");
            let mut client = client;
            let _ = client
                .send(AxMessage::Close(Some(CloseFrame {
                    code: 1013, // try again later
                    reason: "worker unavailable".into(),
                })))
                .await;
            return;
        }
    };

    tracing::info!(persona = %persona, test_id = %test_id, "proxying WebSocket through front door");

    let (mut client_tx, mut client_rx) = client.split();
    let (mut worker_tx, mut worker_rx) = worker.split();

    loop {
        tokio::select! {
            msg = client_rx.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        let Some(msg) = client_to_worker(msg) else { continue };
                        if worker_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    _ => break,
                }
            }
            msg = worker_rx.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        let Some(msg) = worker_to_client(msg) else { continue };
                        if client_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    _ => break,
                }
            }
        }
    }

    let _ = worker_tx.close().await;
    let _ = client_tx.close().await;
    tracing::debug!(test_id = %test_id, "proxy closed");
}

// The two Message enums are structurally identical but come from
// different crates; convert through owned primitives.

fn client_to_worker(msg: AxMessage) -> Option<TgMessage> {
    match msg {
        AxMessage::Text(t) => Some(TgMessage::Text(t.to_string().into())),
        AxMessage::Binary(b) => Some(TgMessage::Binary(b)),
        AxMessage::Ping(b) => Some(TgMessage::Ping(b)),
        AxMessage::Pong(b) => Some(TgMessage::Pong(b)),
        AxMessage::Close(frame) => Some(TgMessage::Close(frame.map(|f| {
            tokio_tungstenite::tungstenite::protocol::CloseFrame {
                code: CloseCode::from(f.code),
                reason: f.reason.to_string().into(),
            }
        }))),
    }
}

fn worker_to_client(msg: TgMessage) -> Option<AxMessage> {
    match msg {
        TgMessage::Text(t) => Some(AxMessage::Text(t.to_string().into())),
        TgMessage::Binary(b) => Some(AxMessage::Binary(b)),
        TgMessage::Ping(b) => Some(AxMessage::Ping(b)),
        TgMessage::Pong(b) => Some(AxMessage::Pong(b)),
        TgMessage::Close(frame) => Some(AxMessage::Close(frame.map(|f| CloseFrame {
            code: f.code.into(),
            reason: f.reason.to_string().into(),
        }))),
        TgMessage::Frame(_) => None,
    }
}

// ── GET /virtual-household/stats ────────────────────────────────────

/// Merged snapshot of per-worker counters. Eventually consistent: each
/// worker's snapshot is as fresh as its last 250 ms metrics tick.
pub async fn household_stats(State(state): State<AppState>) -> impl IntoResponse {
    let mut workers = serde_json::Map::new();
    for persona in ALL_PERSONAS {
        let url = format!("{}/stats", state.config().worker_url(persona));
        let value = match state.http().get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                resp.json::<serde_json::Value>().await.ok()
            }
            _ => None,
        };
        workers.insert(
            persona.as_str().to_string(),
            value.unwrap_or(serde_json::Value::Null),
        );
    }

    Json(serde_json::json!({
        "architecture": "multi-process",
        "consistency": "eventually-consistent, last-250ms",
        "active_tests": state.tests().len(),
        "workers": workers,
    }))
}
