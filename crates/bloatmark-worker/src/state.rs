//! Shared worker state.
//!
//! Connections are owned exclusively by their connection task; everything
//! here is either a registration lookup, an atomic counter, or a snapshot
//! the task refreshes for `/stats` readers.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;

use bloatmark_common::persona::Persona;
use bloatmark_common::protocol::{ConnectionSnapshot, WorkerStats};

/// State shared across all request handlers and connection tasks.
#[derive(Clone)]
pub struct WorkerState {
    inner: Arc<Inner>,
}

struct Inner {
    persona: Persona,
    started_at: Instant,
    /// Live connections, keyed by connection id.
    connections: DashMap<String, ConnectionHandle>,
    /// Tests announced by the orchestrator, keyed by test id.
    registrations: DashMap<String, Registration>,
    total_connections: AtomicU64,
    protocol_violations: AtomicU64,
    congested_drops: AtomicU64,
    bytes_up_total: AtomicU64,
    bytes_down_total: AtomicU64,
    /// Last watchdog heartbeat, as ms since `started_at`.
    last_heartbeat_ms: AtomicU64,
    /// Last observed scheduling stall, as ms since `started_at`.
    /// `u64::MAX` means never.
    last_stall_ms: AtomicU64,
    /// Flipped once on SIGTERM; connections drain when it changes.
    shutdown_tx: watch::Sender<bool>,
}

/// A test the orchestrator announced before redirecting its client.
pub struct Registration {
    pub client_addr: IpAddr,
    pub deadline: Instant,
    pub target_bps: Option<u64>,
    /// Flipped by `/terminate`; every connection of the test subscribes.
    pub terminate_tx: watch::Sender<bool>,
}

/// Handle to a live connection. The snapshot is refreshed by the owning
/// task on its metrics cadence; readers get eventual consistency.
pub struct ConnectionHandle {
    pub test_id: String,
    pub snapshot: Arc<Mutex<ConnectionSnapshot>>,
}

impl WorkerState {
    pub fn new(persona: Persona) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                persona,
                started_at: Instant::now(),
                connections: DashMap::new(),
                registrations: DashMap::new(),
                total_connections: AtomicU64::new(0),
                protocol_violations: AtomicU64::new(0),
                congested_drops: AtomicU64::new(0),
                bytes_up_total: AtomicU64::new(0),
                bytes_down_total: AtomicU64::new(0),
                last_heartbeat_ms: AtomicU64::new(0),
                last_stall_ms: AtomicU64::new(u64::MAX),
                shutdown_tx,
            }),
        }
    }

    pub fn persona(&self) -> Persona {
        self.inner.persona
    }

    /// Milliseconds since worker start on the monotonic clock. This is
    /// the `ts` domain of every frame this worker emits.
    pub fn elapsed_ms(&self) -> f64 {
        self.inner.started_at.elapsed().as_secs_f64() * 1000.0
    }

    // ── Registrations ───────────────────────────────────────────

    /// Insert or refresh a test registration. Re-registration updates the
    /// deadline and target (the household warmup pushes its measured rate
    /// this way).
    pub fn register_test(
        &self,
        test_id: String,
        client_addr: IpAddr,
        deadline: Instant,
        target_bps: Option<u64>,
    ) {
        match self.inner.registrations.entry(test_id) {
            Entry::Occupied(mut e) => {
                let reg = e.get_mut();
                reg.client_addr = client_addr;
                reg.deadline = deadline;
                reg.target_bps = target_bps;
            }
            Entry::Vacant(e) => {
                let (terminate_tx, _) = watch::channel(false);
                e.insert(Registration {
                    client_addr,
                    deadline,
                    target_bps,
                    terminate_tx,
                });
            }
        }
    }

    /// Look up a registration for a handshake: returns the drain watch,
    /// deadline, and target when the test is known and the peer matches.
    ///
    /// Loopback peers are the front door's degraded-mode proxy, which
    /// has already verified the real client address against the
    /// orchestrator's registration; they skip the comparison.
    pub fn authenticate(
        &self,
        test_id: &str,
        peer: IpAddr,
    ) -> Result<(watch::Receiver<bool>, Instant, Option<u64>), AuthError> {
        let reg = self
            .inner
            .registrations
            .get(test_id)
            .ok_or(AuthError::UnknownTest)?;
        if reg.client_addr != peer && !peer.is_loopback() {
            return Err(AuthError::AddressMismatch);
        }
        Ok((reg.terminate_tx.subscribe(), reg.deadline, reg.target_bps))
    }

    /// Signal every connection of a test to drain. Returns whether the
    /// test was known here.
    pub fn terminate_test(&self, test_id: &str) -> bool {
        match self.inner.registrations.get(test_id) {
            Some(reg) => {
                let _ = reg.terminate_tx.send(true);
                true
            }
            None => false,
        }
    }

    /// Drop registrations whose deadline has passed and whose
    /// connections are gone.
    pub fn sweep_registrations(&self) {
        let now = Instant::now();
        self.inner.registrations.retain(|test_id, reg| {
            if now < reg.deadline + Duration::from_secs(30) {
                return true;
            }
            let in_use = self
                .inner
                .connections
                .iter()
                .any(|c| c.value().test_id == *test_id);
            in_use
        });
    }

    // ── Connections ─────────────────────────────────────────────

    pub fn insert_connection(&self, conn_id: String, handle: ConnectionHandle) {
        self.inner.total_connections.fetch_add(1, Ordering::Relaxed);
        self.inner.connections.insert(conn_id, handle);
    }

    pub fn remove_connection(&self, conn_id: &str) {
        self.inner.connections.remove(conn_id);
    }

    pub fn active_connections(&self) -> usize {
        self.inner.connections.len()
    }

    // ── Counters ────────────────────────────────────────────────

    pub fn count_violation(&self) {
        self.inner.protocol_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_congested_drop(&self) {
        self.inner.congested_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, up: u64, down: u64) {
        self.inner.bytes_up_total.fetch_add(up, Ordering::Relaxed);
        self.inner.bytes_down_total.fetch_add(down, Ordering::Relaxed);
    }

    // ── Watchdog ────────────────────────────────────────────────

    pub fn beat(&self) {
        self.inner
            .last_heartbeat_ms
            .store(self.elapsed_ms() as u64, Ordering::Relaxed);
    }

    /// Time since the event loop last proved it was being scheduled.
    pub fn heartbeat_age(&self) -> Duration {
        let last = self.inner.last_heartbeat_ms.load(Ordering::Relaxed);
        let now = self.elapsed_ms() as u64;
        Duration::from_millis(now.saturating_sub(last))
    }

    /// Record that the watchdog observed a missed scheduling budget.
    pub fn note_stall(&self) {
        self.inner
            .last_stall_ms
            .store(self.elapsed_ms() as u64, Ordering::Relaxed);
    }

    /// Time since the last observed stall; `Duration::MAX` if never.
    pub fn last_stall_age(&self) -> Duration {
        let last = self.inner.last_stall_ms.load(Ordering::Relaxed);
        if last == u64::MAX {
            return Duration::MAX;
        }
        let now = self.elapsed_ms() as u64;
        Duration::from_millis(now.saturating_sub(last))
    }

    // ── Shutdown ────────────────────────────────────────────────

    pub fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.inner.shutdown_tx.subscribe()
    }

    // ── Stats ───────────────────────────────────────────────────

    /// Point-in-time snapshot for `/stats`. Eventually consistent: each
    /// connection snapshot is as fresh as its last metrics tick.
    pub fn stats(&self) -> WorkerStats {
        let connections: Vec<ConnectionSnapshot> = self
            .inner
            .connections
            .iter()
            .map(|e| e.value().snapshot.lock().expect("snapshot lock").clone())
            .collect();
        WorkerStats {
            persona: self.inner.persona,
            active_connections: connections.len(),
            total_connections: self.inner.total_connections.load(Ordering::Relaxed),
            bytes_up: self.inner.bytes_up_total.load(Ordering::Relaxed),
            bytes_down: self.inner.bytes_down_total.load(Ordering::Relaxed),
            protocol_violations: self.inner.protocol_violations.load(Ordering::Relaxed),
            congested_drops: self.inner.congested_drops.load(Ordering::Relaxed),
            connections,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum AuthError {
    UnknownTest,
    AddressMismatch,
}
