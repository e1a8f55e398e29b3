//! API integration tests for bloatmark-server.
//!
//! These tests exercise the REST surface through axum's tower service
//! interface (no TCP). The telemetry store runs on an in-memory SQLite
//! database, one per test; the client address is injected with
//! `MockConnectInfo`.

use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::connect_info::MockConnectInfo;
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;

use bloatmark_common::config::Config;
use bloatmark_server::state::AppState;
use bloatmark_server::telemetry;

const CLIENT_ADDR: [u8; 4] = [203, 0, 113, 9];

/// Build a test app over a fresh in-memory store. `env` overrides
/// configuration variables.
async fn test_app_with(env: &[(&str, &str)]) -> (Router, AppState) {
    let pool = telemetry::store::connect_memory().await.unwrap();
    telemetry::store::migrate(&pool).await.unwrap();

    let config = Config::from_lookup(|var| {
        env.iter()
            .find(|(k, _)| *k == var)
            .map(|(_, v)| v.to_string())
    })
    .unwrap();

    let state = AppState::new(pool, config);
    let app = bloatmark_server::app(state.clone())
        .layer(MockConnectInfo(SocketAddr::from((CLIENT_ADDR, 41000))));
    (app, state)
}

async fn test_app() -> (Router, AppState) {
    test_app_with(&[]).await
}

/// Helper: parse JSON response body.
async fn json_body(resp: axum::response::Response) -> serde_json::Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap_or_else(|_| {
        let text = String::from_utf8_lossy(&bytes);
        panic!("not valid JSON: {text}");
    })
}

/// Helper: build a JSON POST request.
fn json_post(uri: &str, body: serde_json::Value) -> axum::http::Request<Body> {
    axum::http::Request::builder()
        .uri(uri)
        .method("POST")
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

fn get(uri: &str) -> axum::http::Request<Body> {
    axum::http::Request::builder()
        .uri(uri)
        .method("GET")
        .body(Body::empty())
        .unwrap()
}

/// Helper: build a GET request with a bearer token.
fn auth_get(uri: &str, token: &str) -> axum::http::Request<Body> {
    axum::http::Request::builder()
        .uri(uri)
        .method("GET")
        .header("authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap()
}

fn sample_result(test_id: &str, grade: &str) -> serde_json::Value {
    serde_json::json!({
        "test_id": test_id,
        "kind": "single",
        "grade": grade,
        "baseline_rtt_ms": 12.5,
        "loaded_rtt_ms": 58.0,
        "download_mbps": 480.0,
        "upload_mbps": 39.0,
        "duration_s": 40.0,
    })
}

// ── Liveness ────────────────────────────────────────────────────────

#[tokio::test]
async fn health_is_ok() {
    let (app, _) = test_app().await;
    let resp = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body = json_body(resp).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn ping_is_empty_200() {
    let (app, _) = test_app().await;
    let resp = app.oneshot(get("/ping")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    assert!(bytes.is_empty());
}

// ── Download ────────────────────────────────────────────────────────

#[tokio::test]
async fn download_streams_exact_byte_count() {
    let (app, _) = test_app().await;
    let resp = app.oneshot(get("/download?size=100000")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(bytes.len(), 100_000);
}

#[tokio::test]
async fn download_payload_is_not_constant() {
    let (app, _) = test_app().await;
    let resp = app.oneshot(get("/download?size=4096")).await.unwrap();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    // Random payload: all-equal bytes would mean a compressible stream.
    assert!(bytes.iter().any(|b| *b != bytes[0]));
}

#[tokio::test]
async fn download_zero_size_is_empty_200() {
    let (app, _) = test_app().await;
    let resp = app.oneshot(get("/download?size=0")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    assert!(bytes.is_empty());
}

#[tokio::test]
async fn download_oversize_rejected_before_streaming() {
    let (app, _) = test_app_with(&[("MAX_DOWNLOAD_BYTES", "1000000")]).await;
    let resp = app.oneshot(get("/download?size=1000001")).await.unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn download_sse_mode_emits_progress_events() {
    let (app, _) = test_app().await;
    let resp = app
        .oneshot(
            axum::http::Request::builder()
                .uri("/download?size=1000")
                .header("accept", "text/event-stream")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let content_type = resp.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/event-stream"));
    let text = String::from_utf8(
        resp.into_body().collect().await.unwrap().to_bytes().to_vec(),
    )
    .unwrap();
    assert!(text.contains("event: chunk"), "{text}");
    assert!(text.contains("event: complete"), "{text}");
}

// ── Upload ──────────────────────────────────────────────────────────

#[tokio::test]
async fn upload_counts_and_summarizes() {
    let (app, _) = test_app().await;
    let payload = vec![0xA5u8; 50_000];
    let resp = app
        .oneshot(
            axum::http::Request::builder()
                .uri("/upload")
                .method("POST")
                .body(Body::from(payload))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body = json_body(resp).await;
    assert_eq!(body["bytes_received"], 50_000);
    assert!(body["observed_mbps"].as_f64().unwrap() > 0.0);
}

#[tokio::test]
async fn upload_declared_oversize_is_413() {
    let (app, _) = test_app_with(&[("MAX_UPLOAD_BYTES", "1024")]).await;
    let resp = app
        .oneshot(
            axum::http::Request::builder()
                .uri("/upload")
                .method("POST")
                .header("content-length", "2048")
                .body(Body::from(vec![0u8; 2048]))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), 413);
}

#[tokio::test]
async fn upload_streamed_oversize_is_413() {
    // No content-length up front: the cap is enforced while draining.
    let (app, _) = test_app_with(&[("MAX_UPLOAD_BYTES", "1024")]).await;
    let resp = app
        .oneshot(
            axum::http::Request::builder()
                .uri("/upload")
                .method("POST")
                .body(Body::from(vec![0u8; 4096]))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), 413);
}

// ── Orchestrator ────────────────────────────────────────────────────

#[tokio::test]
async fn test_start_returns_phase_plan() {
    let (app, _) = test_app().await;
    let resp = app
        .oneshot(json_post(
            "/api/test-start",
            serde_json::json!({ "test_id": "itest-single-0001", "kind": "single" }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body = json_body(resp).await;
    assert_eq!(body["test_id"], "itest-single-0001");
    let plan = body["phase_plan"].as_array().unwrap();
    assert_eq!(plan.len(), 6);
    assert_eq!(plan[0]["phase"], "baseline");
    assert_eq!(plan[0]["start_ms"], 0);
    assert_eq!(plan[5]["phase"], "bidirectional");
    // No gaps: each slot starts where the previous one ends.
    for pair in plan.windows(2) {
        assert_eq!(pair[0]["end_ms"], pair[1]["start_ms"]);
    }
}

#[tokio::test]
async fn second_concurrent_start_from_same_address_is_429() {
    let (app, _) = test_app().await;
    let resp = app
        .clone()
        .oneshot(json_post(
            "/api/test-start",
            serde_json::json!({ "test_id": "itest-conc-0001", "kind": "single" }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = app
        .oneshot(json_post(
            "/api/test-start",
            serde_json::json!({ "test_id": "itest-conc-0002", "kind": "single" }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), 429);
    let body = json_body(resp).await;
    assert!(body["error"].as_str().unwrap().contains("already running"));
}

#[tokio::test]
async fn malformed_test_id_is_400() {
    let (app, _) = test_app().await;
    let resp = app
        .oneshot(json_post(
            "/api/test-start",
            serde_json::json!({ "test_id": "short", "kind": "single" }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn baseline_rejects_tagged_bulk_streams() {
    let (app, _) = test_app().await;
    let resp = app
        .clone()
        .oneshot(json_post(
            "/api/test-start",
            serde_json::json!({ "test_id": "itest-base-0001", "kind": "single" }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // The test is in its 5-second baseline: tagged downloads must be
    // refused so the baseline RTT stays unloaded.
    let resp = app
        .clone()
        .oneshot(get("/download?size=1000&test_id=itest-base-0001"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);

    // Untagged downloads (other users) are unaffected.
    let resp = app
        .oneshot(get("/download?size=1000"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn download_admitted_once_baseline_ends() {
    let (app, state) = test_app().await;
    let mut progress = state.subscribe_progress();

    let resp = app
        .clone()
        .oneshot(json_post(
            "/api/test-start",
            serde_json::json!({ "test_id": "itest-phase-0001", "kind": "single" }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // Wait out the baseline (5s) plus scheduling slack.
    tokio::time::sleep(std::time::Duration::from_millis(5300)).await;

    let resp = app
        .oneshot(get("/download?size=1000&test_id=itest-phase-0001"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200, "download-warmup phase admits downloads");

    // The orchestrator broadcast the transitions along the way.
    let mut saw_started = false;
    let mut saw_warmup = false;
    while let Ok(event) = progress.try_recv() {
        let json = serde_json::to_string(&event).unwrap();
        saw_started |= json.contains("test.started");
        saw_warmup |= json.contains("download-warmup");
    }
    assert!(saw_started);
    assert!(saw_warmup);
}

#[tokio::test]
async fn tagged_stream_for_unknown_test_is_404() {
    let (app, _) = test_app().await;
    let resp = app
        .oneshot(get("/download?size=1000&test_id=itest-none-0001"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

// ── Discovery ───────────────────────────────────────────────────────

#[tokio::test]
async fn discovery_unknown_persona_is_404() {
    let (app, _) = test_app().await;
    let resp = app
        .oneshot(get("/ws/virtual-household/torrent"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn discovery_degrades_when_worker_is_down() {
    // No worker processes exist in this test: the health probe fails and
    // the hint must fall back to the proxied path.
    let (app, _) = test_app().await;
    let resp = app
        .oneshot(get("/ws/virtual-household/gaming"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body = json_body(resp).await;
    assert_eq!(body["redirect"], false);
    assert_eq!(body["architecture"], "multi-process");
    assert!(body["websocket_url"]
        .as_str()
        .unwrap()
        .contains("/ws/virtual-household/gaming"));
}

#[tokio::test]
async fn household_stats_reports_down_workers_as_null() {
    let (app, _) = test_app().await;
    let resp = app.oneshot(get("/virtual-household/stats")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body = json_body(resp).await;
    assert_eq!(body["architecture"], "multi-process");
    assert!(body["workers"]["gaming"].is_null());
    assert!(body["workers"]["bulk"].is_null());
}

// ── Telemetry ───────────────────────────────────────────────────────

#[tokio::test]
async fn submit_then_read_back() {
    let (app, _) = test_app().await;
    let resp = app
        .clone()
        .oneshot(json_post(
            "/api/telemetry/submit",
            sample_result("itest-tele-0001", "A"),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body = json_body(resp).await;
    assert_eq!(body["outcome"], "inserted");

    let resp = app.oneshot(get("/api/telemetry/recent")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body = json_body(resp).await;
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["test_id"], "itest-tele-0001");
    // Address is stamped server-side from the connection.
    assert_eq!(results[0]["client_addr"], "203.0.113.9");
}

#[tokio::test]
async fn submit_is_idempotent_on_test_id() {
    let (app, _) = test_app().await;
    for grade in ["B", "A"] {
        let resp = app
            .clone()
            .oneshot(json_post(
                "/api/telemetry/submit",
                sample_result("itest-idem-0001", grade),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }

    let resp = app.oneshot(get("/api/telemetry/recent")).await.unwrap();
    let body = json_body(resp).await;
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 1, "one row per test id");
    assert_eq!(results[0]["grade"], "A", "last write wins in the window");
}

#[tokio::test]
async fn submit_invalid_schema_is_400() {
    let (app, _) = test_app().await;
    let resp = app
        .clone()
        .oneshot(json_post(
            "/api/telemetry/submit",
            serde_json::json!({ "test_id": "itest-bad-0001", "kind": "single", "grade": "Z",
                "baseline_rtt_ms": 1.0, "loaded_rtt_ms": 2.0, "download_mbps": 3.0,
                "upload_mbps": 4.0, "duration_s": 5.0 }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = app
        .oneshot(json_post(
            "/api/telemetry/submit",
            serde_json::json!({ "nonsense": true }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn ring_keeps_only_newest_k() {
    let (app, _) = test_app_with(&[("TELEMETRY_RING_SIZE", "3")]).await;
    for i in 0..5 {
        let resp = app
            .clone()
            .oneshot(json_post(
                "/api/telemetry/submit",
                sample_result(&format!("itest-ring-{i:04}"), "C"),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }

    let resp = app.oneshot(get("/api/telemetry/recent?limit=10")).await.unwrap();
    let body = json_body(resp).await;
    let ids: Vec<&str> = body["results"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["test_id"].as_str().unwrap())
        .collect();
    assert_eq!(ids.len(), 3);
    assert!(!ids.contains(&"itest-ring-0000"));
    assert!(!ids.contains(&"itest-ring-0001"));
    assert!(ids.contains(&"itest-ring-0004"));
}

#[tokio::test]
async fn by_client_filters_addresses() {
    let (app, _) = test_app().await;
    app.clone()
        .oneshot(json_post(
            "/api/telemetry/submit",
            sample_result("itest-addr-0001", "A"),
        ))
        .await
        .unwrap();

    let resp = app
        .clone()
        .oneshot(get("/api/telemetry/by_client/203.0.113.9"))
        .await
        .unwrap();
    let body = json_body(resp).await;
    assert_eq!(body["results"].as_array().unwrap().len(), 1);

    let resp = app
        .oneshot(get("/api/telemetry/by_client/198.51.100.1"))
        .await
        .unwrap();
    let body = json_body(resp).await;
    assert!(body["results"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn stats_includes_histogram_and_teardown_counter() {
    let (app, _) = test_app().await;
    app.clone()
        .oneshot(json_post(
            "/api/telemetry/submit",
            sample_result("itest-stat-0001", "A"),
        ))
        .await
        .unwrap();

    let resp = app.oneshot(get("/api/telemetry/stats")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body = json_body(resp).await;
    assert_eq!(body["total"], 1);
    assert_eq!(body["grades"]["A"], 1);
    assert_eq!(body["forced_teardowns"], 0);
}

// ── Admin auth ──────────────────────────────────────────────────────

#[tokio::test]
async fn admin_reads_require_bearer_when_configured() {
    let (app, _) = test_app_with(&[("TELEMETRY_API_KEY", "sekrit-token")]).await;

    for uri in [
        "/api/telemetry/recent",
        "/api/telemetry/by_client/203.0.113.9",
        "/api/telemetry/stats",
    ] {
        let resp = app.clone().oneshot(get(uri)).await.unwrap();
        assert_eq!(resp.status(), 401, "{uri} must require auth");

        let resp = app
            .clone()
            .oneshot(auth_get(uri, "wrong-token"))
            .await
            .unwrap();
        assert_eq!(resp.status(), 401, "{uri} must reject bad tokens");

        let resp = app
            .clone()
            .oneshot(auth_get(uri, "sekrit-token"))
            .await
            .unwrap();
        assert_eq!(resp.status(), 200, "{uri} must accept the token");
    }

    // Submit stays open to same-origin callers.
    let resp = app
        .oneshot(json_post(
            "/api/telemetry/submit",
            sample_result("itest-auth-0001", "B"),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

// ── Metrics ─────────────────────────────────────────────────────────

#[tokio::test]
async fn metrics_renders_prometheus_text() {
    let (app, _) = test_app().await;
    let resp = app.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let text = String::from_utf8(
        resp.into_body().collect().await.unwrap().to_bytes().to_vec(),
    )
    .unwrap();
    assert!(text.contains("bloatmark_active_tests 0"));
    assert!(text.contains("bloatmark_forced_teardowns_total 0"));
    assert!(text.contains(r#"bloatmark_worker_up{persona="gaming"} 0"#));
}
