//! Bloatmark ping responder.
//!
//! A dedicated process on its own port so that a saturated accept queue
//! or busy worker on the bulk path can never skew latency samples.
//!
//! `GET /ping` answers an empty 200 immediately; the same path upgrades
//! to a WebSocket that echoes every frame verbatim. The echo path does
//! no parsing and no allocation beyond what the transport forces, and
//! frames are written back one-for-one — there is no queue to build up
//! behind.

use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, OptionalFromRequestParts};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use bloatmark_common::config::Config;

/// Bloatmark isolated ping responder.
#[derive(Parser, Debug)]
#[command(name = "bloatmark-ping", about = "Bloatmark latency probe responder")]
struct Cli {
    /// Listen port override (defaults to PING_PORT).
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    let port = cli.port.unwrap_or(config.ping_port);

    let app = Router::new()
        .route("/ping", get(ping))
        .route("/health", get(health));

    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "bloatmark-ping listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Thin wrapper so a missing/invalid upgrade request falls through to the
/// plain 200 response instead of rejecting the request outright.
struct MaybeWebSocketUpgrade(Option<WebSocketUpgrade>);

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

/// Plain GET → empty 200. With upgrade headers → verbatim echo socket.
async fn ping(ws: Option<MaybeWebSocketUpgrade>) -> Response {
    match ws.and_then(|w| w.0) {
        Some(ws) => ws.on_upgrade(echo),
        None => StatusCode::OK.into_response(),
    }
}

async fn echo(mut socket: WebSocket) {
    while let Some(Ok(msg)) = socket.recv().await {
        let reply = match msg {
            Message::Text(_) | Message::Binary(_) => msg,
            Message::Ping(payload) => Message::Pong(payload),
            Message::Close(_) => break,
            Message::Pong(_) => continue,
        };
        if socket.send(reply).await.is_err() {
            break;
        }
    }
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
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
