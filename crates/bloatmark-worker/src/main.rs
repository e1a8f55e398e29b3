//! Bloatmark persona worker.
//!
//! One process per household persona, each on its own port with its own
//! event loop, so a misbehaving bulk pattern can never degrade the
//! latency-sensitive personas.
//!
//! - Accepts measurement WebSockets for pre-registered tests
//! - Generates the persona's downstream traffic pattern
//! - Runs the per-connection ping loop and 4 Hz metric stream
//! - Exposes `/health` and `/stats` for the supervisor and front door

mod connection;
mod latency;
mod routes;
mod state;
mod traffic;
mod watchdog;

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use bloatmark_common::config::Config;
use bloatmark_common::persona::Persona;

use state::WorkerState;

/// Bloatmark persona worker daemon.
#[derive(Parser, Debug)]
#[command(name = "bloatmark-worker", about = "Bloatmark persona worker")]
struct Cli {
    /// Persona this worker serves (gaming, video-call, streaming, bulk).
    #[arg(long)]
    persona: Persona,

    /// Listen port override (defaults to the persona's configured port).
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
    let port = cli.port.unwrap_or(config.persona_port(cli.persona));

    let state = WorkerState::new(cli.persona);

    tracing::info!(
        persona = %cli.persona,
        port,
        dscp = ?cli.persona.dscp(),
        "bloatmark-worker starting"
    );

    // ── Watchdog ────────────────────────────────────────────────
    let watchdog_state = state.clone();
    tokio::spawn(async move { watchdog::run(watchdog_state).await });

    // ── Listener ────────────────────────────────────────────────
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    set_dscp(&listener, cli.persona);

    let app = routes::router(state.clone());

    // ── Serve, drain on signal ──────────────────────────────────
    let shutdown_state = state.clone();
    let graceful = async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received, draining connections");
        shutdown_state.shutdown();
    };

    tracing::info!(%addr, "worker listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(graceful)
    .await?;

    // Connections drain inside the graceful window; give stragglers a
    // bounded wait before exiting.
    let drain_deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while state.active_connections() > 0 && tokio::time::Instant::now() < drain_deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    tracing::info!("bloatmark-worker stopped");
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

/// Mark the listener with the persona's DSCP class. Accepted sockets
/// inherit it on Linux. Best-effort: downstream equipment may strip it
/// and the test does not depend on it surviving.
#[cfg(unix)]
fn set_dscp(listener: &tokio::net::TcpListener, persona: Persona) {
    use std::os::fd::AsRawFd;

    let tos = persona.dscp().tos_byte() as libc::c_int;
    let rc = unsafe {
        libc::setsockopt(
            listener.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_TOS,
            &tos as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        tracing::warn!(
            persona = %persona,
            errno = std::io::Error::last_os_error().raw_os_error(),
            "failed to set IP_TOS (continuing without DSCP marking)"
        );
    }
}

#[cfg(not(unix))]
fn set_dscp(_listener: &tokio::net::TcpListener, _persona: Persona) {}
