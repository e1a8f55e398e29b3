//! Per-connection task.
//!
//! One task owns each WebSocket for its whole life and drives the state
//! machine `accepted → authenticated → running → draining → closed`. A
//! companion writer task owns the sink with two queues in front of it:
//! control frames (pings, metrics, terminate) are drained strictly ahead
//! of bulk payload, so a saturated downlink can never delay a latency
//! probe on the server side.
//!
//! Bulk enqueue is flow-controlled for fill traffic (await capacity) and
//! non-blocking for paced traffic; a paced connection that cannot keep
//! its queue under the byte cap is congested and dropped.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures::sink::SinkExt;
use futures::stream::{SplitSink, SplitStream, StreamExt};
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use bloatmark_common::ids;
use bloatmark_common::protocol::{close_code, ClientFrame, ConnectionSnapshot, ServerFrame};
use bloatmark_common::stats::{Ewma, RateCounter, EMA_ALPHA, RATE_WINDOW};

use crate::latency::{PingTracker, PongError};
use crate::state::{ConnectionHandle, WorkerState};
use crate::traffic::Pacer;

/// Per-connection send-queue byte cap. Beyond this a paced connection is
/// congested and dropped.
const SEND_QUEUE_CAP: usize = 256 * 1024;

/// Idle timeout: no inbound traffic for this long closes the connection.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Drain window: in-flight pings may complete for this long.
const DRAIN_WINDOW: Duration = Duration::from_secs(1);

const METRICS_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnPhase {
    Accepted,
    Authenticated,
    Running,
    Draining,
    Closed,
}

impl ConnPhase {
    fn as_str(&self) -> &'static str {
        match self {
            ConnPhase::Accepted => "accepted",
            ConnPhase::Authenticated => "authenticated",
            ConnPhase::Running => "running",
            ConnPhase::Draining => "draining",
            ConnPhase::Closed => "closed",
        }
    }
}

/// Why the connection left `running`.
enum Exit {
    /// Orderly teardown with a drain window for in-flight pings.
    Drain(&'static str),
    /// Socket gone (client close, read/write error): nothing can
    /// complete any more, skip the drain window.
    Gone,
    /// Protocol violation: close with an application code, count it.
    Violation(u16, &'static str),
    /// Send queue overran its cap; counted at the detection site.
    Congested(&'static str),
}

/// Removes the connection from the registry even if the task panics.
struct ConnGuard {
    state: WorkerState,
    conn_id: String,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.state.remove_connection(&self.conn_id);
    }
}

pub async fn run(
    state: WorkerState,
    socket: WebSocket,
    peer: SocketAddr,
    test_id: String,
    terminate_rx: watch::Receiver<bool>,
    deadline: Instant,
    target_bps: Option<u64>,
) {
    let conn_id = ids::connection_id();
    let mut phase = ConnPhase::Accepted;
    tracing::info!(
        conn_id = %conn_id,
        test_id = %test_id,
        peer = %peer,
        persona = %state.persona(),
        state = phase.as_str(),
        "connection accepted"
    );

    let snapshot = Arc::new(Mutex::new(ConnectionSnapshot {
        connection_id: conn_id.clone(),
        test_id: test_id.clone(),
        peer_addr: peer.to_string(),
        state: phase.as_str().into(),
        age_ms: 0,
        bytes_up: 0,
        bytes_down: 0,
        messages_up: 0,
        messages_down: 0,
        rtt_ms: 0.0,
        jitter_ms: 0.0,
        loss_pct: 0.0,
        total_pings: 0,
    }));
    state.insert_connection(
        conn_id.clone(),
        ConnectionHandle {
            test_id: test_id.clone(),
            snapshot: snapshot.clone(),
        },
    );
    let _guard = ConnGuard {
        state: state.clone(),
        conn_id: conn_id.clone(),
    };

    // Registration and peer address were checked at upgrade time.
    phase = ConnPhase::Authenticated;
    set_snapshot_state(&snapshot, phase);

    let (ws_tx, ws_rx) = socket.split();

    // Control frames jump the bulk queue; see module docs. The bulk
    // channel's message capacity is derived from the byte cap so fill
    // back-pressure engages at the cap, not above it.
    let (ctrl_tx, ctrl_rx) = mpsc::channel::<Message>(64);
    let frame_bytes = state.persona().download_profile().frame_bytes();
    let bulk_capacity = (SEND_QUEUE_CAP / frame_bytes).clamp(4, 4096);
    let (bulk_tx, bulk_rx) = mpsc::channel::<Bytes>(bulk_capacity);
    let queued_bytes = Arc::new(AtomicUsize::new(0));

    let writer = tokio::spawn(write_loop(ws_tx, ctrl_rx, bulk_rx, queued_bytes.clone()));

    phase = ConnPhase::Running;
    set_snapshot_state(&snapshot, phase);

    let ctx = RunCtx {
        conn_id: &conn_id,
        snapshot: &snapshot,
        ctrl_tx: &ctrl_tx,
        bulk_tx: &bulk_tx,
        queued_bytes: &queued_bytes,
        deadline,
        target_bps,
    };
    let (mut ws_rx, exit) = run_phase(&state, ctx, ws_rx, terminate_rx).await;

    // ── Drain ───────────────────────────────────────────────────
    let (code, reason) = match exit {
        Exit::Drain(reason) => {
            phase = ConnPhase::Draining;
            set_snapshot_state(&snapshot, phase);
            tracing::debug!(conn_id = %conn_id, reason, "draining");
            let _ = ctrl_tx
                .send(text_frame(&ServerFrame::Terminate {
                    reason: reason.into(),
                }))
                .await;
            drain(&mut ws_rx).await;
            (1000, reason)
        }
        Exit::Gone => (1000, "peer-closed"),
        Exit::Violation(code, reason) => {
            state.count_violation();
            (code, reason)
        }
        Exit::Congested(reason) => (close_code::CONGESTED, reason),
    };

    let _ = ctrl_tx
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
    drop(ctrl_tx);
    drop(bulk_tx);
    let _ = writer.await;

    phase = ConnPhase::Closed;
    set_snapshot_state(&snapshot, phase);
    let (up, down) = {
        let snap = snapshot.lock().expect("snapshot lock");
        (snap.bytes_up, snap.bytes_down)
    };
    state.add_bytes(up, down);
    tracing::info!(
        conn_id = %conn_id,
        reason,
        bytes_up = up,
        bytes_down = down,
        "connection closed"
    );
}

struct RunCtx<'a> {
    conn_id: &'a str,
    snapshot: &'a Arc<Mutex<ConnectionSnapshot>>,
    ctrl_tx: &'a mpsc::Sender<Message>,
    bulk_tx: &'a mpsc::Sender<Bytes>,
    queued_bytes: &'a Arc<AtomicUsize>,
    deadline: Instant,
    target_bps: Option<u64>,
}

/// The `running` select loop. Returns the reader half so the drain phase
/// can keep consuming late pongs.
async fn run_phase(
    state: &WorkerState,
    ctx: RunCtx<'_>,
    mut ws_rx: SplitStream<WebSocket>,
    mut terminate_rx: watch::Receiver<bool>,
) -> (SplitStream<WebSocket>, Exit) {
    let mut rng = SmallRng::from_os_rng();
    let mut pacer = Pacer::new(
        state.persona().download_profile(),
        ctx.target_bps,
        Instant::now(),
    );
    let deadline_driven = pacer.is_deadline_driven();

    let mut tracker = PingTracker::new();
    let mut up_rate = RateCounter::new(RATE_WINDOW);
    let mut down_rate = RateCounter::new(RATE_WINDOW);
    let mut ema_up = Ewma::new(EMA_ALPHA);
    let mut ema_down = Ewma::new(EMA_ALPHA);
    let mut messages_up: u64 = 0;
    let mut messages_down: u64 = 0;
    let mut last_inbound = Instant::now();
    let opened_at = Instant::now();

    let ping_period = Duration::from_millis(state.persona().ping_interval_ms());
    let mut ping_ticker =
        tokio::time::interval_at(tokio::time::Instant::now() + ping_period, ping_period);
    ping_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut metrics_ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + METRICS_INTERVAL,
        METRICS_INTERVAL,
    );
    metrics_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut housekeeping = tokio::time::interval(Duration::from_secs(1));

    let mut shutdown_rx = state.subscribe_shutdown();

    let exit = loop {
        tokio::select! {
            // Paced traffic: sleep to the pacer's deadline, emit a frame.
            _ = tokio::time::sleep_until(pacer.next_deadline().into()), if deadline_driven => {
                let n = pacer.tick(&mut rng);
                if n > 0 {
                    let queued = ctx.queued_bytes.load(Ordering::Relaxed);
                    if queued + n > SEND_QUEUE_CAP {
                        state.count_congested_drop();
                        tracing::warn!(
                            conn_id = %ctx.conn_id,
                            queued,
                            "send queue over cap, dropping connection"
                        );
                        break Exit::Congested("send queue overrun");
                    }
                    let chunk = random_chunk(&mut rng, n);
                    // Never await here: a full queue would stall the ping
                    // cadence behind bulk writes.
                    match ctx.bulk_tx.try_send(chunk) {
                        Ok(()) => {
                            ctx.queued_bytes.fetch_add(n, Ordering::Relaxed);
                            down_rate.record(Instant::now(), n as u64);
                            messages_down += 1;
                        }
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            state.count_congested_drop();
                            break Exit::Congested("send queue overrun");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => break Exit::Gone,
                    }
                }
            }

            // Fill traffic: emit whenever the queue has room.
            permit = ctx.bulk_tx.reserve(), if !deadline_driven => {
                match permit {
                    Ok(permit) => {
                        let n = pacer.frame_bytes();
                        let chunk = random_chunk(&mut rng, n);
                        ctx.queued_bytes.fetch_add(n, Ordering::Relaxed);
                        down_rate.record(Instant::now(), n as u64);
                        messages_down += 1;
                        permit.send(chunk);
                    }
                    Err(_) => break Exit::Gone,
                }
            }

            // Latency probe cadence.
            _ = ping_ticker.tick() => {
                let frame = tracker.next_ping(state.elapsed_ms(), Instant::now());
                // Probes must never wait: a full control queue means the
                // writer is wedged behind a dead peer.
                if ctx.ctrl_tx.try_send(text_frame(&frame)).is_err() {
                    state.count_congested_drop();
                    break Exit::Congested("control queue overrun");
                }
            }

            // Telemetry cadence.
            _ = metrics_ticker.tick() => {
                let now = Instant::now();
                let up_bps = up_rate.rate(now) * 8.0;
                let down_bps = down_rate.rate(now) * 8.0;
                let frame = ServerFrame::Metrics {
                    bytes_up: up_rate.total(),
                    bytes_down: down_rate.total(),
                    ema_bps_up: ema_up.update(up_bps),
                    ema_bps_down: ema_down.update(down_bps),
                    rtt_ms: tracker.rtt_ms(),
                    jitter_ms: tracker.jitter_ms(),
                    loss_pct: tracker.loss_pct(),
                    ts: state.elapsed_ms(),
                };
                if ctx.ctrl_tx.try_send(text_frame(&frame)).is_err() {
                    state.count_congested_drop();
                    break Exit::Congested("control queue overrun");
                }
                refresh_snapshot(
                    ctx.snapshot,
                    opened_at,
                    &up_rate,
                    &down_rate,
                    messages_up,
                    messages_down,
                    &tracker,
                );
            }

            // Timeouts and lost-probe sweeping.
            _ = housekeeping.tick() => {
                let now = Instant::now();
                tracker.sweep(now);
                if now.duration_since(last_inbound) > IDLE_TIMEOUT {
                    break Exit::Drain("idle-timeout");
                }
                if now >= ctx.deadline {
                    break Exit::Drain("test-deadline");
                }
            }

            // Inbound frames.
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Binary(b))) => {
                        last_inbound = Instant::now();
                        up_rate.record(last_inbound, b.len() as u64);
                        messages_up += 1;
                    }
                    Some(Ok(Message::Text(text))) => {
                        last_inbound = Instant::now();
                        up_rate.record(last_inbound, text.len() as u64);
                        messages_up += 1;
                        if let Err(exit) = handle_text(&mut tracker, &text) {
                            break exit;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break Exit::Gone,
                    Some(Ok(_)) => {} // ws-level ping/pong, handled by axum
                    Some(Err(e)) => {
                        tracing::debug!(conn_id = %ctx.conn_id, error = %e, "read error");
                        break Exit::Gone;
                    }
                }
            }

            // Orchestrator terminate for this test.
            _ = terminate_rx.changed() => {
                if *terminate_rx.borrow() {
                    break Exit::Drain("test-terminated");
                }
            }

            // Worker shutdown.
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break Exit::Drain("worker-shutdown");
                }
            }
        }
    };

    // Final refresh so the closing byte totals are exact, not as stale as
    // the last metrics tick.
    refresh_snapshot(
        ctx.snapshot,
        opened_at,
        &up_rate,
        &down_rate,
        messages_up,
        messages_down,
        &tracker,
    );
    (ws_rx, exit)
}

fn handle_text(tracker: &mut PingTracker, text: &str) -> Result<(), Exit> {
    match serde_json::from_str::<ClientFrame>(text) {
        Ok(ClientFrame::Pong { seq, .. }) => match tracker.record_pong(seq, Instant::now()) {
            Ok(_) => Ok(()),
            Err(PongError::SequenceRegression { seq, highest }) => {
                tracing::warn!(seq, highest, "pong sequence regression");
                Err(Exit::Violation(
                    close_code::SEQUENCE_REGRESSION,
                    "sequence regression",
                ))
            }
        },
        Err(e) => {
            tracing::debug!(error = %e, "unparsable client frame");
            Err(Exit::Violation(close_code::PROTOCOL_VIOLATION, "bad frame"))
        }
    }
}

/// Drain window: no new traffic or metrics; the socket is read for up to
/// one second so in-flight pongs land before the close frame.
async fn drain(ws_rx: &mut SplitStream<WebSocket>) {
    let deadline = tokio::time::Instant::now() + DRAIN_WINDOW;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => break,
            msg = ws_rx.next() => match msg {
                Some(Ok(_)) => {} // late pongs; too late to score
                _ => break,
            }
        }
    }
}

/// Writer task: owns the sink. Control frames are always sent before any
/// queued bulk payload (`biased` keeps the ordering deterministic).
async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut ctrl_rx: mpsc::Receiver<Message>,
    mut bulk_rx: mpsc::Receiver<Bytes>,
    queued_bytes: Arc<AtomicUsize>,
) {
    loop {
        tokio::select! {
            biased;
            msg = ctrl_rx.recv() => match msg {
                Some(msg) => {
                    let closing = matches!(msg, Message::Close(_));
                    if ws_tx.send(msg).await.is_err() || closing {
                        break;
                    }
                }
                None => break,
            },
            chunk = bulk_rx.recv() => match chunk {
                Some(chunk) => {
                    queued_bytes.fetch_sub(chunk.len(), Ordering::Relaxed);
                    if ws_tx.send(Message::Binary(chunk)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
    let _ = ws_tx.flush().await;
}

fn text_frame(frame: &ServerFrame) -> Message {
    Message::Text(
        serde_json::to_string(frame)
            .expect("frame serialization")
            .into(),
    )
}

fn random_chunk(rng: &mut SmallRng, n: usize) -> Bytes {
    let mut buf = vec![0u8; n];
    rng.fill_bytes(&mut buf);
    Bytes::from(buf)
}

fn refresh_snapshot(
    snapshot: &Arc<Mutex<ConnectionSnapshot>>,
    opened_at: Instant,
    up_rate: &RateCounter,
    down_rate: &RateCounter,
    messages_up: u64,
    messages_down: u64,
    tracker: &PingTracker,
) {
    let mut snap = snapshot.lock().expect("snapshot lock");
    snap.age_ms = opened_at.elapsed().as_millis() as u64;
    snap.bytes_up = up_rate.total();
    snap.bytes_down = down_rate.total();
    snap.messages_up = messages_up;
    snap.messages_down = messages_down;
    snap.rtt_ms = tracker.rtt_ms();
    snap.jitter_ms = tracker.jitter_ms();
    snap.loss_pct = tracker.loss_pct();
    snap.total_pings = tracker.total_sent();
}

fn set_snapshot_state(snapshot: &Arc<Mutex<ConnectionSnapshot>>, phase: ConnPhase) {
    snapshot.lock().expect("snapshot lock").state = phase.as_str().into();
}
