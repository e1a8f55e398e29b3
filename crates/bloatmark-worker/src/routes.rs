//! Worker HTTP surface: health, stats, loopback control, and the
//! measurement WebSocket.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use bloatmark_common::ids;
use bloatmark_common::protocol::{RegisterTest, TerminateTest};

use crate::connection;
use crate::state::{AuthError, WorkerState};

/// `/health` reports unhealthy when the event loop has missed its
/// scheduling budget within the last second.
const HEALTH_STALL_WINDOW: Duration = Duration::from_secs(1);

pub fn router(state: WorkerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/register", post(register))
        .route("/terminate", post(terminate))
        .route("/{persona}", get(ws_upgrade))
        .with_state(state)
}

// ── GET /health ─────────────────────────────────────────────────────

async fn health(State(state): State<WorkerState>) -> Response {
    let age = state.heartbeat_age();
    let stalled_recently = state.last_stall_age() < HEALTH_STALL_WINDOW;
    if age > HEALTH_STALL_WINDOW || stalled_recently {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "stalled",
                "persona": state.persona(),
                "heartbeat_age_ms": age.as_millis() as u64,
            })),
        )
            .into_response()
    } else {
        Json(serde_json::json!({
            "status": "ok",
            "persona": state.persona(),
            "active_connections": state.active_connections(),
        }))
        .into_response()
    }
}

// ── GET /stats ──────────────────────────────────────────────────────

async fn stats(State(state): State<WorkerState>) -> impl IntoResponse {
    Json(state.stats())
}

// ── POST /register (loopback only) ──────────────────────────────────

async fn register(
    State(state): State<WorkerState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(body): Json<RegisterTest>,
) -> Response {
    if let Err(resp) = require_loopback(peer) {
        return resp;
    }
    if !ids::valid_test_id(&body.test_id) {
        return error(StatusCode::BAD_REQUEST, "invalid test_id");
    }
    let client_addr = match body.client_addr.parse() {
        Ok(addr) => addr,
        Err(_) => return error(StatusCode::BAD_REQUEST, "invalid client_addr"),
    };

    let deadline = Instant::now() + Duration::from_millis(body.deadline_ms);
    state.register_test(body.test_id.clone(), client_addr, deadline, body.target_bps);
    tracing::info!(
        test_id = %body.test_id,
        client_addr = %body.client_addr,
        target_bps = ?body.target_bps,
        "test registered"
    );
    Json(serde_json::json!({ "ok": true })).into_response()
}

// ── POST /terminate (loopback only) ─────────────────────────────────

async fn terminate(
    State(state): State<WorkerState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(body): Json<TerminateTest>,
) -> Response {
    if let Err(resp) = require_loopback(peer) {
        return resp;
    }
    let known = state.terminate_test(&body.test_id);
    tracing::info!(test_id = %body.test_id, reason = %body.reason, known, "terminate requested");
    Json(serde_json::json!({ "ok": true, "known": known })).into_response()
}

// ── WS /{persona}?test_id=… ─────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WsQuery {
    test_id: String,
}

async fn ws_upgrade(
    State(state): State<WorkerState>,
    Path(persona): Path<String>,
    Query(query): Query<WsQuery>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    if persona != state.persona().as_str() {
        return error(StatusCode::NOT_FOUND, "unknown persona");
    }
    if !ids::valid_test_id(&query.test_id) {
        return error(StatusCode::BAD_REQUEST, "invalid test_id");
    }

    // The orchestrator registers tests before redirecting the client;
    // an unknown id or a different source address is rejected before the
    // upgrade completes.
    let (terminate_rx, deadline, target_bps) = match state.authenticate(&query.test_id, peer.ip())
    {
        Ok(auth) => auth,
        Err(AuthError::UnknownTest) => {
            tracing::warn!(test_id = %query.test_id, peer = %peer, "unknown test id");
            return error(StatusCode::FORBIDDEN, "unknown test id");
        }
        Err(AuthError::AddressMismatch) => {
            tracing::warn!(test_id = %query.test_id, peer = %peer, "address mismatch");
            return error(StatusCode::FORBIDDEN, "address mismatch");
        }
    };

    let test_id = query.test_id;
    ws.on_upgrade(move |socket| {
        connection::run(state, socket, peer, test_id, terminate_rx, deadline, target_bps)
    })
}

// ── Helpers ─────────────────────────────────────────────────────────

fn require_loopback(peer: SocketAddr) -> Result<(), Response> {
    if peer.ip().is_loopback() {
        Ok(())
    } else {
        Err(error(StatusCode::FORBIDDEN, "loopback only"))
    }
}

fn error(status: StatusCode, msg: &str) -> Response {
    (status, Json(serde_json::json!({ "error": msg }))).into_response()
}
