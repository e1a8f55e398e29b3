//! Telemetry endpoints.
//!
//! POST /api/telemetry/submit            — persist a result (same-origin, open)
//! GET  /api/telemetry/recent?limit=     — admin read
//! GET  /api/telemetry/by_client/{addr}  — admin read
//! GET  /api/telemetry/stats             — admin read
//!
//! Admin reads require the bearer token when `TELEMETRY_API_KEY` is
//! configured; without a configured key they are open (dev mode).

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;

use bloatmark_common::model::TestResult;

use crate::error::ApiError;
use crate::state::AppState;
use crate::telemetry::{store::SubmitOutcome, webhook};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/submit", post(submit))
        .route("/recent", get(recent))
        .route("/by_client/{addr}", get(by_client))
        .route("/stats", get(stats))
}

// ── Bearer guard ────────────────────────────────────────────────────

/// Extractor that enforces the configured telemetry bearer token.
pub struct AdminAuth;

impl FromRequestParts<AppState> for AdminAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.config().telemetry_api_key.as_deref() else {
            return Ok(AdminAuth);
        };

        let token = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;

        if token == expected {
            Ok(AdminAuth)
        } else {
            Err(ApiError::unauthorized("invalid bearer token"))
        }
    }
}

// ── POST /submit ────────────────────────────────────────────────────

async fn submit(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(raw): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut result: TestResult = serde_json::from_value(raw.clone())
        .map_err(|e| ApiError::bad_request(format!("invalid schema: {e}")))?;
    result
        .validate()
        .map_err(|e| ApiError::bad_request(format!("invalid schema: {e}")))?;

    // Stamp at the trust boundary: the client does not get to choose its
    // address or timestamp.
    result.client_addr = peer.ip().to_string();
    result.ts = Utc::now().timestamp_millis();

    let outcome = state
        .store()
        .submit(&result, &raw.to_string())
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;

    tracing::info!(
        test_id = %result.test_id,
        grade = %result.grade,
        outcome = outcome.as_str(),
        "result submitted"
    );

    if outcome != SubmitOutcome::Discarded {
        webhook::spawn_delivery(&state, &result);
    }

    Ok(Json(serde_json::json!({
        "ok": true,
        "outcome": outcome.as_str(),
    })))
}

// ── Admin reads ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<u32>,
}

async fn recent(
    _auth: AdminAuth,
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let limit = query.limit.unwrap_or(50).min(200);
    let rows = state
        .store()
        .recent(limit)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(serde_json::json!({ "results": rows })))
}

async fn by_client(
    _auth: AdminAuth,
    State(state): State<AppState>,
    Path(addr): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let limit = query.limit.unwrap_or(50).min(50);
    let rows = state
        .store()
        .by_client(&addr, limit)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(serde_json::json!({ "results": rows })))
}

async fn stats(
    _auth: AdminAuth,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let store_stats = state
        .store()
        .stats()
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(serde_json::json!({
        "total": store_stats.total,
        "grades": store_stats.grades,
        "tests_last_24h": store_stats.tests_last_24h,
        "rate_per_hour_24h": store_stats.rate_per_hour_24h,
        "forced_teardowns": state.forced_teardowns(),
        "active_tests": state.tests().len(),
    })))
}
