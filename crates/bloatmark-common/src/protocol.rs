//! Wire protocol: WebSocket measurement frames and loopback control
//! messages.
//!
//! Measurement frames are flat JSON text with a `type` discriminator —
//! they are high-rate (metrics at 4 Hz, pings up to 20 Hz per connection)
//! and their schema is the compatibility contract with the browser
//! client. Bulk payload travels as binary frames and never appears here.
//!
//! Loopback messages ride plain HTTP between the orchestrator, the
//! supervisor, and the workers on 127.0.0.1; origin checks apply but no
//! authentication.

use serde::{Deserialize, Serialize};

use crate::persona::Persona;

// ── Worker → client frames ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Latency probe. `ts` is f64 milliseconds since worker start on the
    /// worker's monotonic clock; `seq` is strictly monotonic per
    /// connection.
    Ping { ts: f64, seq: u32 },

    /// Telemetry snapshot, emitted every 250 ms while `running`.
    Metrics {
        bytes_up: u64,
        bytes_down: u64,
        ema_bps_up: f64,
        ema_bps_down: f64,
        rtt_ms: f64,
        jitter_ms: f64,
        loss_pct: f64,
        ts: f64,
    },

    /// The connection is entering its drain window; the client should
    /// close after any in-flight pongs.
    Terminate { reason: String },
}

// ── Client → worker frames ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Echo of a `ping`: same `ts` and `seq`, plus the client's own
    /// wall-clock in `client_ts`.
    Pong { ts: f64, seq: u32, client_ts: f64 },
}

/// WebSocket close codes for protocol violations (4xxx application range).
pub mod close_code {
    /// Unknown test id or address mismatch at handshake.
    pub const UNAUTHORIZED: u16 = 4001;
    /// Unparsable frame or unknown frame type.
    pub const PROTOCOL_VIOLATION: u16 = 4002;
    /// Ping sequence regression in a pong.
    pub const SEQUENCE_REGRESSION: u16 = 4003;
    /// Send queue overran its cap.
    pub const CONGESTED: u16 = 4008;
}

// ── Loopback control: orchestrator/supervisor ↔ worker ──────────────

/// `POST /register` on a worker: announce a test before the client is
/// redirected to the worker's port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterTest {
    pub test_id: String,
    /// Client IP the WebSocket must come from.
    pub client_addr: String,
    /// Hard deadline for the test, in ms from now.
    pub deadline_ms: u64,
    /// Measured downstream target for the bulk persona (80th-percentile
    /// of the warmup probe). `None` means continuous fill.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_bps: Option<u64>,
}

/// `POST /terminate` on a worker: drain every connection of a test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminateTest {
    pub test_id: String,
    pub reason: String,
}

// ── Worker stats snapshot ───────────────────────────────────────────

/// Snapshot of one live connection, exposed via the worker's `/stats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub connection_id: String,
    pub test_id: String,
    pub peer_addr: String,
    pub state: String,
    pub age_ms: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub messages_up: u64,
    pub messages_down: u64,
    pub rtt_ms: f64,
    pub jitter_ms: f64,
    pub loss_pct: f64,
    pub total_pings: u64,
}

/// Whole-worker snapshot: merged by the front door's stats aggregation,
/// documented eventually-consistent (last 250 ms).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStats {
    pub persona: Persona,
    pub active_connections: usize,
    pub total_connections: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub protocol_violations: u64,
    pub congested_drops: u64,
    pub connections: Vec<ConnectionSnapshot>,
}

// ── Progress events ─────────────────────────────────────────────────

/// Events pushed to progress WebSocket subscribers on the front door.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ProgressEvent {
    #[serde(rename = "test.started")]
    Started { test_id: String, kind: String },

    #[serde(rename = "test.phase")]
    Phase {
        test_id: String,
        phase: String,
        /// Stream concurrency the client should run in this phase.
        target_download_streams: u32,
        target_upload_streams: u32,
    },

    #[serde(rename = "test.completed")]
    Completed { test_id: String },

    #[serde(rename = "test.aborted")]
    Aborted { test_id: String, reason: String },
}
