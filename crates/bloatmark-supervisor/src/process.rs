//! Child process management.
//!
//! Children are spawned detached from any shell, stopped with SIGTERM
//! first, and force-killed only when the grace window expires. A new
//! process for a port is spawned only after the old one's port is
//! verified released.

use std::path::PathBuf;
use std::process::{Child, Command};
use std::time::{Duration, Instant};

/// What to run and where it should be listening.
#[derive(Debug, Clone)]
pub struct ChildSpec {
    /// Display name for logs (`worker-gaming`, `ping`, `front-door`).
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub port: u16,
}

impl ChildSpec {
    pub fn health_url(&self) -> String {
        format!("http://127.0.0.1:{}/health", self.port)
    }
}

pub struct ChildProcess {
    child: Child,
    started_at: Instant,
}

impl ChildProcess {
    pub fn spawn(spec: &ChildSpec) -> anyhow::Result<Self> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        tracing::info!(name = %spec.name, cmd = ?cmd, "spawning child");
        let child = cmd.spawn()?;
        Ok(ChildProcess {
            child,
            started_at: Instant::now(),
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Non-blocking liveness check. Returns the exit code when the child
    /// has exited.
    pub fn check_exit(&mut self) -> Option<Option<i32>> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.code()),
            Ok(None) => None,
            Err(_) => Some(None),
        }
    }

    pub fn send_sigterm(&self) {
        #[cfg(unix)]
        unsafe {
            libc::kill(self.child.id() as i32, libc::SIGTERM);
        }
        #[cfg(not(unix))]
        tracing::warn!("SIGTERM not supported on this platform");
    }

    /// Wait for exit, polling, up to `timeout`.
    pub async fn wait_with_timeout(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => return true,
                Err(_) => return true,
                Ok(None) => {
                    if Instant::now() >= deadline {
                        return false;
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// SIGTERM, wait for `grace`, then SIGKILL.
    pub async fn stop(mut self, grace: Duration) {
        self.send_sigterm();
        if self.wait_with_timeout(grace).await {
            tracing::info!(pid = self.pid(), "child exited cleanly");
        } else {
            tracing::warn!(pid = self.pid(), "child ignored SIGTERM, killing");
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Probe until nothing is listening on the port any more. Returns false
/// when the port is still held at the deadline.
pub async fn wait_port_released(port: u16, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        match tokio::net::TcpStream::connect(("127.0.0.1", port)).await {
            Err(_) => return true,
            Ok(_) => {
                if Instant::now() >= deadline {
                    return false;
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
    }
}
