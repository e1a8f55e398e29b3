//! Prometheus metrics endpoint for the front door.
//!
//! `GET /metrics` — renders front-door gauges and, when reachable,
//! per-worker counters gathered over loopback, in Prometheus text
//! exposition format. A single scrape covers the whole fleet.
//!
//! This endpoint requires no authentication (standard Prometheus
//! practice).

use std::fmt::Write;

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;

use bloatmark_common::persona::ALL_PERSONAS;
use bloatmark_common::protocol::WorkerStats;

use crate::state::AppState;

pub async fn handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut out = String::with_capacity(4096);

    writeln!(
        out,
        "# HELP bloatmark_active_tests Tests currently tracked by the orchestrator."
    )
    .unwrap();
    writeln!(out, "# TYPE bloatmark_active_tests gauge").unwrap();
    writeln!(out, "bloatmark_active_tests {}", state.tests().len()).unwrap();

    writeln!(
        out,
        "# HELP bloatmark_forced_teardowns_total Streams evicted after a teardown grace expired."
    )
    .unwrap();
    writeln!(out, "# TYPE bloatmark_forced_teardowns_total counter").unwrap();
    writeln!(
        out,
        "bloatmark_forced_teardowns_total {}",
        state.forced_teardowns()
    )
    .unwrap();

    if let Ok(stats) = state.store().stats().await {
        writeln!(
            out,
            "# HELP bloatmark_results_stored Test results currently in the telemetry ring."
        )
        .unwrap();
        writeln!(out, "# TYPE bloatmark_results_stored gauge").unwrap();
        writeln!(out, "bloatmark_results_stored {}", stats.total).unwrap();
    }

    // Per-worker counters, gathered over loopback. A down worker simply
    // reports up=0.
    for persona in ALL_PERSONAS {
        let url = format!("{}/stats", state.config().worker_url(persona));
        let stats: Option<WorkerStats> = match state.http().get(&url).send().await {
            Ok(resp) if resp.status().is_success() => resp.json().await.ok(),
            _ => None,
        };
        render_worker(&mut out, persona.as_str(), stats.as_ref());
    }

    (
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        out,
    )
}

fn render_worker(out: &mut String, persona: &str, stats: Option<&WorkerStats>) {
    writeln!(
        out,
        "bloatmark_worker_up{{persona=\"{persona}\"}} {}",
        if stats.is_some() { 1 } else { 0 }
    )
    .unwrap();
    let Some(stats) = stats else {
        return;
    };
    writeln!(
        out,
        "bloatmark_worker_active_connections{{persona=\"{persona}\"}} {}",
        stats.active_connections
    )
    .unwrap();
    writeln!(
        out,
        "bloatmark_worker_connections_total{{persona=\"{persona}\"}} {}",
        stats.total_connections
    )
    .unwrap();
    writeln!(
        out,
        "bloatmark_worker_bytes_up_total{{persona=\"{persona}\"}} {}",
        stats.bytes_up
    )
    .unwrap();
    writeln!(
        out,
        "bloatmark_worker_bytes_down_total{{persona=\"{persona}\"}} {}",
        stats.bytes_down
    )
    .unwrap();
    writeln!(
        out,
        "bloatmark_worker_protocol_violations_total{{persona=\"{persona}\"}} {}",
        stats.protocol_violations
    )
    .unwrap();
    writeln!(
        out,
        "bloatmark_worker_congested_drops_total{{persona=\"{persona}\"}} {}",
        stats.congested_drops
    )
    .unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;
    use bloatmark_common::persona::Persona;

    fn sample_stats() -> WorkerStats {
        WorkerStats {
            persona: Persona::Gaming,
            active_connections: 2,
            total_connections: 17,
            bytes_up: 1_000,
            bytes_down: 2_000_000,
            protocol_violations: 1,
            congested_drops: 0,
            connections: vec![],
        }
    }

    #[test]
    fn worker_metrics_rendering() {
        let mut out = String::new();
        render_worker(&mut out, "gaming", Some(&sample_stats()));
        assert!(out.contains(r#"bloatmark_worker_up{persona="gaming"} 1"#));
        assert!(out.contains(r#"bloatmark_worker_active_connections{persona="gaming"} 2"#));
        assert!(out.contains(r#"bloatmark_worker_bytes_down_total{persona="gaming"} 2000000"#));
        assert!(out.contains(r#"bloatmark_worker_protocol_violations_total{persona="gaming"} 1"#));
    }

    #[test]
    fn down_worker_renders_up_zero_only() {
        let mut out = String::new();
        render_worker(&mut out, "bulk", None);
        assert!(out.contains(r#"bloatmark_worker_up{persona="bulk"} 0"#));
        assert!(!out.contains("bloatmark_worker_active_connections"));
    }
}
