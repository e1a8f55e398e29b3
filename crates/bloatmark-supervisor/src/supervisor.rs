//! The supervision loop.
//!
//! Spawns one worker per persona plus the ping responder and the front
//! door, probes every child's `/health` on a 5-second cadence, and
//! restarts any child that exits or fails three consecutive probes. At
//! any moment there is at most one live process per spec; a replacement
//! is spawned only after the old port is verified released.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bloatmark_common::config::Config;
use bloatmark_common::persona::ALL_PERSONAS;

use crate::process::{wait_port_released, ChildProcess, ChildSpec};

const PROBE_INTERVAL: Duration = Duration::from_secs(5);
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const FAILURE_THRESHOLD: u32 = 3;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const PORT_RELEASE_WAIT: Duration = Duration::from_secs(5);

struct Managed {
    spec: ChildSpec,
    child: ChildProcess,
    consecutive_failures: u32,
}

/// Build the spawn table from the configuration. Binaries are siblings
/// of the supervisor executable.
pub fn child_specs(config: &Config, bin_dir: &Path) -> Vec<ChildSpec> {
    let bin = |name: &str| -> PathBuf {
        let mut p = bin_dir.join(name);
        if cfg!(windows) {
            p.set_extension("exe");
        }
        p
    };

    let mut specs = Vec::with_capacity(ALL_PERSONAS.len() + 2);
    for persona in ALL_PERSONAS {
        specs.push(ChildSpec {
            name: format!("worker-{persona}"),
            program: bin("bloatmark-worker"),
            args: vec!["--persona".into(), persona.as_str().into()],
            port: config.persona_port(persona),
        });
    }
    specs.push(ChildSpec {
        name: "ping".into(),
        program: bin("bloatmark-ping"),
        args: vec![],
        port: config.ping_port,
    });
    specs.push(ChildSpec {
        name: "front-door".into(),
        program: bin("bloatmark-server"),
        args: vec![],
        port: config.front_door_port,
    });
    specs
}

pub async fn run(config: Config, bin_dir: PathBuf) -> anyhow::Result<()> {
    let client = reqwest::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .build()?;

    // ── Spawn the fleet ─────────────────────────────────────────
    let mut fleet: Vec<Managed> = Vec::new();
    for spec in child_specs(&config, &bin_dir) {
        let child = ChildProcess::spawn(&spec)?;
        tracing::info!(name = %spec.name, pid = child.pid(), port = spec.port, "child started");
        fleet.push(Managed {
            spec,
            child,
            consecutive_failures: 0,
        });
    }

    // ── Probe loop ──────────────────────────────────────────────
    let mut ticker = tokio::time::interval(PROBE_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for managed in fleet.iter_mut() {
                    probe_one(&client, managed).await;
                }
            }
            _ = shutdown_signal() => {
                tracing::info!("shutdown signal received, terminating fleet");
                break;
            }
        }
    }

    // ── Shutdown ────────────────────────────────────────────────
    for managed in &fleet {
        managed.child.send_sigterm();
    }
    for managed in fleet {
        let name = managed.spec.name.clone();
        managed.child.stop(SHUTDOWN_GRACE).await;
        tracing::info!(name = %name, "child stopped");
    }
    Ok(())
}

async fn probe_one(client: &reqwest::Client, managed: &mut Managed) {
    // A child that exited on its own (e.g. a worker's watchdog tripping)
    // is respawned without waiting out the failure threshold.
    if let Some(code) = managed.child.check_exit() {
        tracing::warn!(
            name = %managed.spec.name,
            exit_code = ?code,
            uptime_s = managed.child.uptime().as_secs(),
            "child exited unexpectedly"
        );
        respawn(managed).await;
        return;
    }

    let healthy = match client.get(managed.spec.health_url()).send().await {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    };

    if healthy {
        managed.consecutive_failures = 0;
        return;
    }

    managed.consecutive_failures += 1;
    tracing::warn!(
        name = %managed.spec.name,
        failures = managed.consecutive_failures,
        "health probe failed"
    );
    if managed.consecutive_failures >= FAILURE_THRESHOLD {
        tracing::error!(name = %managed.spec.name, "failure threshold reached, restarting");
        managed.child.send_sigterm();
        if !managed.child.wait_with_timeout(SHUTDOWN_GRACE).await {
            tracing::warn!(name = %managed.spec.name, "unresponsive child ignored SIGTERM");
        }
        respawn(managed).await;
    }
}

/// Replace a dead or unhealthy child. The old process object is dropped
/// here; its port must be free before the replacement binds.
async fn respawn(managed: &mut Managed) {
    if !wait_port_released(managed.spec.port, PORT_RELEASE_WAIT).await {
        // Something still holds the port; force-kill through the old
        // handle and probe once more before giving up this round.
        tracing::warn!(
            name = %managed.spec.name,
            port = managed.spec.port,
            "port still held, forcing old process down"
        );
        managed.child.send_sigterm();
        let _ = managed.child.wait_with_timeout(Duration::from_secs(1)).await;
        if !wait_port_released(managed.spec.port, PORT_RELEASE_WAIT).await {
            tracing::error!(
                name = %managed.spec.name,
                port = managed.spec.port,
                "port not released, will retry next probe"
            );
            managed.consecutive_failures = FAILURE_THRESHOLD;
            return;
        }
    }

    match ChildProcess::spawn(&managed.spec) {
        Ok(child) => {
            tracing::info!(name = %managed.spec.name, pid = child.pid(), "child respawned");
            managed.child = child;
            managed.consecutive_failures = 0;
        }
        Err(e) => {
            tracing::error!(name = %managed.spec.name, error = %e, "respawn failed");
            // Leave the failure count saturated so the next tick retries.
            managed.consecutive_failures = FAILURE_THRESHOLD;
        }
    }
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
