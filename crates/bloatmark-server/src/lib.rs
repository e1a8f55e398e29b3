//! Bloatmark front-door library.
//!
//! Re-exports the router, shared state, and telemetry utilities so they
//! can be used by integration tests and the server binary.

pub mod bulk;
pub mod discovery;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod progress_ws;
pub mod serve;
pub mod state;
pub mod telemetry;

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use error::ApiError;
use state::AppState;

/// Build the complete front-door router.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ping", get(ping))
        .route("/download", get(bulk::download))
        .route("/upload", post(bulk::upload))
        .route(
            "/ws/virtual-household/{persona}",
            get(discovery::virtual_household),
        )
        .route("/virtual-household/stats", get(discovery::household_stats))
        .route("/ws/progress", get(progress_ws::handler))
        .route("/metrics", get(metrics::handler))
        .route("/api/test-start", post(test_start))
        .nest("/api/telemetry", telemetry::api::router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Convenience latency probe on the front door. The isolated responder
/// on `PING_PORT` is the measurement path; this one exists so
/// single-listener deployments still work.
async fn ping() -> impl IntoResponse {
    StatusCode::OK
}

async fn test_start(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(req): Json<orchestrator::StartRequest>,
) -> Result<Json<orchestrator::StartResponse>, ApiError> {
    let resp = orchestrator::start_test(&state, peer.ip(), req).await?;
    Ok(Json(resp))
}
