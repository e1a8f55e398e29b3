//! Bloatmark front door.
//!
//! Single binary that runs:
//! - the bulk download/upload endpoints for the single-user test
//! - worker discovery (and the degraded-mode WebSocket proxy)
//! - the test orchestrator and its progress WebSocket
//! - the telemetry store, admin API, and outbound webhook
//! - Prometheus metrics

use std::net::SocketAddr;

use tracing_subscriber::EnvFilter;

use bloatmark_common::config::Config;
use bloatmark_server::state::AppState;
use bloatmark_server::{app, serve, telemetry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Configuration (all-or-nothing) ──────────────────────────
    let config = Config::from_env().map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

    // ── Database ────────────────────────────────────────────────
    let pool = telemetry::store::connect(&config.telemetry_db).await?;
    telemetry::store::migrate(&pool).await?;

    // ── Shared state + router ───────────────────────────────────
    let state = AppState::new(pool, config.clone());
    let app = app(state);

    // ── Listen ──────────────────────────────────────────────────
    let addr: SocketAddr = format!("0.0.0.0:{}", config.front_door_port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    if config.tls_enabled() {
        let tls = serve::load_tls_config(
            config.tls_cert.as_deref().expect("validated at load"),
            config.tls_key.as_deref().expect("validated at load"),
        )?;
        tracing::info!("bloatmark-server listening on https://{addr}");
        tokio::select! {
            result = serve::serve_tls(listener, app, tls) => result?,
            _ = shutdown_signal() => {
                tracing::info!("shutdown signal received");
            }
        }
    } else {
        tracing::info!("bloatmark-server listening on http://{addr}");
        serve::serve_plain(listener, app, shutdown_signal()).await?;
    }

    tracing::info!("bloatmark-server stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
