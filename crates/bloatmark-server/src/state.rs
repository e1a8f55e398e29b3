//! Shared front-door application state.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use sqlx::SqlitePool;
use tokio::sync::broadcast;

use bloatmark_common::config::Config;
use bloatmark_common::protocol::ProgressEvent;

use crate::orchestrator::TestEntry;
use crate::telemetry::store::TelemetryStore;

/// State shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    store: TelemetryStore,
    /// Live test entries, keyed by test id.
    tests: DashMap<String, Arc<TestEntry>>,
    /// One live test per client address; value is the test id.
    by_addr: DashMap<IpAddr, String>,
    /// Broadcast channel for progress WebSocket subscribers.
    progress_tx: broadcast::Sender<ProgressEvent>,
    /// Streams killed after the teardown grace expired, process lifetime.
    forced_teardowns: AtomicU64,
    /// Loopback HTTP client for worker control and health probes.
    http: reqwest::Client,
}

impl AppState {
    pub fn new(pool: SqlitePool, config: Config) -> Self {
        let (progress_tx, _) = broadcast::channel(256);
        let store = TelemetryStore::new(pool, config.telemetry_ring_size);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .expect("reqwest client");
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                tests: DashMap::new(),
                by_addr: DashMap::new(),
                progress_tx,
                forced_teardowns: AtomicU64::new(0),
                http,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn store(&self) -> &TelemetryStore {
        &self.inner.store
    }

    pub fn tests(&self) -> &DashMap<String, Arc<TestEntry>> {
        &self.inner.tests
    }

    pub fn by_addr(&self) -> &DashMap<IpAddr, String> {
        &self.inner.by_addr
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.inner.http
    }

    /// Broadcast a progress event to all subscribed observers.
    pub fn broadcast_progress(&self, event: ProgressEvent) {
        // Ignore send errors (no subscribers).
        let _ = self.inner.progress_tx.send(event);
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressEvent> {
        self.inner.progress_tx.subscribe()
    }

    pub fn count_forced_teardowns(&self, n: u64) {
        self.inner.forced_teardowns.fetch_add(n, Ordering::Relaxed);
    }

    pub fn forced_teardowns(&self) -> u64 {
        self.inner.forced_teardowns.load(Ordering::Relaxed)
    }
}
