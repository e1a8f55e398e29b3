//! Test orchestration.
//!
//! One task per accepted test drives the wall-clock phase plan on the
//! monotonic clock, gates which bulk streams may exist in each phase,
//! and guarantees teardown: graceful terminate first, forced registry
//! eviction when the grace expires. Stream registrations are serialised
//! behind the entry's mutex; bulk handlers hold a guard whose drop
//! deregisters as soon as the response future goes away.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use bloatmark_common::ids;
use bloatmark_common::model::{
    plan_duration_ms, plan_for, AbortReason, PhaseKind, PhaseSlot, StreamKind, TestKind,
    TestResult, TestState,
};
use bloatmark_common::persona::{Persona, ALL_PERSONAS};
use bloatmark_common::protocol::{ProgressEvent, RegisterTest, TerminateTest};
use bloatmark_common::stats::percentile;

use crate::error::ApiError;
use crate::state::AppState;

/// Grace for streams retired by a phase transition.
const PHASE_EXIT_GRACE: Duration = Duration::from_secs(2);

/// Grace for the registry to empty after `complete` before forced
/// teardown.
const FINAL_TEARDOWN_GRACE: Duration = Duration::from_secs(5);

/// How long after `complete` the client gets to submit its result before
/// the test is aborted as `no-submission`.
const SUBMIT_GRACE: Duration = Duration::from_secs(60);

// ── Test entry ──────────────────────────────────────────────────────

/// A live test. Owned by the orchestrator task; handlers interact
/// through stream guards and snapshot reads.
pub struct TestEntry {
    pub test_id: String,
    pub kind: TestKind,
    pub client_addr: IpAddr,
    pub started_wall: DateTime<Utc>,
    pub started_at: Instant,
    pub plan: Vec<PhaseSlot>,
    phase: Mutex<PhaseKind>,
    state: Mutex<TestState>,
    streams: Mutex<HashMap<String, StreamHandle>>,
    /// Throughput samples (bits/s) gathered during the household warmup
    /// probe; the 80th percentile becomes the bulk persona's target.
    warmup_samples: Mutex<Vec<f64>>,
}

struct StreamHandle {
    kind: StreamKind,
    terminate_tx: watch::Sender<bool>,
}

impl TestEntry {
    fn new(test_id: String, kind: TestKind, client_addr: IpAddr) -> Self {
        let plan = plan_for(kind);
        let first_phase = plan[0].phase;
        TestEntry {
            test_id,
            kind,
            client_addr,
            started_wall: Utc::now(),
            started_at: Instant::now(),
            plan,
            phase: Mutex::new(first_phase),
            state: Mutex::new(TestState::Running),
            streams: Mutex::new(HashMap::new()),
            warmup_samples: Mutex::new(Vec::new()),
        }
    }

    pub fn phase(&self) -> PhaseKind {
        *self.phase.lock().expect("phase lock")
    }

    fn set_phase(&self, phase: PhaseKind) {
        *self.phase.lock().expect("phase lock") = phase;
    }

    pub fn test_state(&self) -> TestState {
        *self.state.lock().expect("state lock")
    }

    fn set_state(&self, state: TestState) {
        *self.state.lock().expect("state lock") = state;
    }

    pub fn stream_count(&self) -> usize {
        self.streams.lock().expect("streams lock").len()
    }

    pub fn record_warmup_sample(&self, bps: f64) {
        if self.phase() == PhaseKind::Warmup && bps.is_finite() && bps > 0.0 {
            self.warmup_samples.lock().expect("samples lock").push(bps);
        }
    }

    /// 80th percentile of the warmup throughput samples, if any.
    pub fn warmup_p80(&self) -> Option<u64> {
        let samples = self.warmup_samples.lock().expect("samples lock");
        percentile(&samples, 80.0).map(|bps| bps as u64)
    }

    fn register_stream(self: &Arc<Self>, kind: StreamKind) -> StreamGuard {
        let stream_id = ids::stream_id();
        let (terminate_tx, terminate_rx) = watch::channel(false);
        self.streams.lock().expect("streams lock").insert(
            stream_id.clone(),
            StreamHandle { kind, terminate_tx },
        );
        StreamGuard {
            entry: self.clone(),
            stream_id,
            terminate_rx,
        }
    }

    /// Signal terminate to streams not allowed in `phase`; returns their
    /// ids.
    fn signal_disallowed(&self, phase: PhaseKind) -> Vec<String> {
        let streams = self.streams.lock().expect("streams lock");
        let mut doomed = Vec::new();
        for (id, handle) in streams.iter() {
            if !phase.allows(handle.kind) {
                let _ = handle.terminate_tx.send(true);
                doomed.push(id.clone());
            }
        }
        doomed
    }

    /// Signal terminate to every registered stream; returns the count.
    fn signal_all(&self) -> usize {
        let streams = self.streams.lock().expect("streams lock");
        for handle in streams.values() {
            let _ = handle.terminate_tx.send(true);
        }
        streams.len()
    }

    fn any_remaining(&self, ids: &[String]) -> bool {
        let streams = self.streams.lock().expect("streams lock");
        ids.iter().any(|id| streams.contains_key(id))
    }

    /// Forced teardown: evict the given registrations. Returns how many
    /// were still present.
    fn force_remove(&self, ids: &[String]) -> usize {
        let mut streams = self.streams.lock().expect("streams lock");
        ids.iter().filter(|id| streams.remove(*id).is_some()).count()
    }

    fn force_clear(&self) -> usize {
        let mut streams = self.streams.lock().expect("streams lock");
        let n = streams.len();
        streams.clear();
        n
    }

    fn remove_stream(&self, stream_id: &str) {
        self.streams.lock().expect("streams lock").remove(stream_id);
    }
}

/// Held by a bulk handler for the life of its stream. Dropping it (EOF,
/// error, client disconnect) deregisters immediately.
pub struct StreamGuard {
    entry: Arc<TestEntry>,
    stream_id: String,
    terminate_rx: watch::Receiver<bool>,
}

impl StreamGuard {
    /// Non-blocking: has the orchestrator told this stream to stop?
    pub fn terminated(&self) -> bool {
        *self.terminate_rx.borrow()
    }

    pub fn record_warmup_sample(&self, bps: f64) {
        self.entry.record_warmup_sample(bps);
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.entry.remove_stream(&self.stream_id);
    }
}

// ── Stream authorization ────────────────────────────────────────────

/// Admit a bulk stream for a test, or explain why not. Enforces the
/// "baseline is unloaded" invariant and per-phase stream gating.
pub fn authorize_stream(
    state: &AppState,
    test_id: &str,
    kind: StreamKind,
    peer: IpAddr,
) -> Result<StreamGuard, ApiError> {
    let entry = state
        .tests()
        .get(test_id)
        .map(|e| e.value().clone())
        .ok_or_else(|| ApiError::not_found("unknown test"))?;

    if entry.client_addr != peer && !peer.is_loopback() {
        return Err(ApiError::forbidden("address does not match this test"));
    }
    if entry.test_state() != TestState::Running {
        return Err(ApiError::conflict("test is no longer running"));
    }

    let phase = entry.phase();
    if !phase.allows(kind) {
        let msg = if phase == PhaseKind::Baseline {
            "baseline phase is unloaded: no bulk streams permitted".to_string()
        } else {
            format!("{kind} stream not permitted during {phase}")
        };
        return Err(ApiError::conflict(msg));
    }

    Ok(entry.register_stream(kind))
}

// ── Start ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub test_id: String,
    pub kind: TestKind,
}

#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub test_id: String,
    pub kind: TestKind,
    pub phase_plan: Vec<PhaseSlot>,
    pub max_duration_s: u64,
}

pub async fn start_test(
    state: &AppState,
    peer: IpAddr,
    req: StartRequest,
) -> Result<StartResponse, ApiError> {
    if !ids::valid_test_id(&req.test_id) {
        return Err(ApiError::bad_request("invalid test_id"));
    }
    if state.tests().contains_key(&req.test_id) {
        return Err(ApiError::bad_request("test_id already in use"));
    }

    // One live test per client address: the second concurrent start gets
    // its own distinct error, the test is never split.
    match state.by_addr().entry(peer) {
        dashmap::mapref::entry::Entry::Occupied(_) => {
            return Err(ApiError::too_many_requests(
                "a test from this address is already running",
            ));
        }
        dashmap::mapref::entry::Entry::Vacant(slot) => {
            slot.insert(req.test_id.clone());
        }
    }

    let entry = Arc::new(TestEntry::new(req.test_id.clone(), req.kind, peer));
    state.tests().insert(req.test_id.clone(), entry.clone());

    tracing::info!(
        test_id = %entry.test_id,
        kind = %entry.kind,
        client_addr = %peer,
        "test started"
    );
    state.broadcast_progress(ProgressEvent::Started {
        test_id: entry.test_id.clone(),
        kind: entry.kind.as_str().into(),
    });

    // Household clients are about to be redirected to the worker ports;
    // the workers must know the test before the first handshake lands.
    if entry.kind == TestKind::Household {
        register_with_workers(state, &entry, None).await;
    }

    let task_state = state.clone();
    let task_entry = entry.clone();
    tokio::spawn(async move { run_test(task_state, task_entry).await });

    Ok(StartResponse {
        test_id: entry.test_id.clone(),
        kind: entry.kind,
        phase_plan: entry.plan.clone(),
        max_duration_s: state.config().max_test_duration_s,
    })
}

// ── The per-test task ───────────────────────────────────────────────

async fn run_test(state: AppState, entry: Arc<TestEntry>) {
    let hard_deadline =
        entry.started_at + Duration::from_secs(state.config().max_test_duration_s);

    for slot in entry.plan.clone() {
        let at = entry.started_at + Duration::from_millis(slot.start_ms);
        if sleep_or_deadline(at, hard_deadline).await {
            abort_test(&state, &entry, AbortReason::DeadlineExceeded).await;
            cleanup(&state, &entry);
            return;
        }

        entry.set_phase(slot.phase);
        tracing::info!(test_id = %entry.test_id, phase = %slot.phase, "phase transition");
        state.broadcast_progress(ProgressEvent::Phase {
            test_id: entry.test_id.clone(),
            phase: slot.phase.as_str().into(),
            target_download_streams: slot.target_download_streams,
            target_upload_streams: slot.target_upload_streams,
        });

        // Entering household saturation: hand the measured downlink to
        // the bulk worker as its fill target.
        if entry.kind == TestKind::Household && slot.phase == PhaseKind::Saturation {
            let target = entry.warmup_p80();
            match target {
                Some(bps) => {
                    tracing::info!(test_id = %entry.test_id, target_bps = bps, "warmup probe complete");
                }
                None => {
                    tracing::warn!(test_id = %entry.test_id, "warmup saw no samples, bulk will fill unbounded");
                }
            }
            register_with_workers(&state, &entry, target).await;
        }

        // Retire streams that do not belong to the new phase.
        let doomed = entry.signal_disallowed(slot.phase);
        if !doomed.is_empty() {
            enforce_teardown(&state, &entry, doomed, PHASE_EXIT_GRACE).await;
        }
    }

    // Let the final slot run out, then complete.
    let end_at = entry.started_at + Duration::from_millis(plan_duration_ms(&entry.plan));
    if sleep_or_deadline(end_at, hard_deadline).await {
        abort_test(&state, &entry, AbortReason::DeadlineExceeded).await;
        cleanup(&state, &entry);
        return;
    }

    complete_test(&state, &entry).await;

    if wait_for_submission(&state, &entry, hard_deadline).await {
        tracing::info!(test_id = %entry.test_id, "result submitted, test finished");
    } else {
        abort_test(&state, &entry, AbortReason::NoSubmission).await;
    }
    cleanup(&state, &entry);
}

/// Sleep until `at`; true when the hard deadline fires first.
async fn sleep_or_deadline(at: Instant, hard_deadline: Instant) -> bool {
    if at >= hard_deadline {
        tokio::time::sleep_until(hard_deadline.into()).await;
        return true;
    }
    tokio::time::sleep_until(at.into()).await;
    false
}

async fn complete_test(state: &AppState, entry: &Arc<TestEntry>) {
    entry.set_phase(PhaseKind::Complete);
    tracing::info!(test_id = %entry.test_id, "test complete, tearing down streams");
    state.broadcast_progress(ProgressEvent::Phase {
        test_id: entry.test_id.clone(),
        phase: PhaseKind::Complete.as_str().into(),
        target_download_streams: 0,
        target_upload_streams: 0,
    });

    let signaled = entry.signal_all();
    if entry.kind == TestKind::Household {
        terminate_workers(state, entry, "test-complete").await;
    }

    if signaled > 0 {
        let all: Vec<String> = {
            let streams = entry.streams.lock().expect("streams lock");
            streams.keys().cloned().collect()
        };
        enforce_teardown(state, entry, all, FINAL_TEARDOWN_GRACE).await;
    }

    entry.set_state(TestState::Complete);
    state.broadcast_progress(ProgressEvent::Completed {
        test_id: entry.test_id.clone(),
    });
}

async fn abort_test(state: &AppState, entry: &Arc<TestEntry>, reason: AbortReason) {
    tracing::warn!(test_id = %entry.test_id, reason = %reason, "test aborted");
    entry.set_state(TestState::Aborted);
    entry.set_phase(PhaseKind::Complete);

    entry.signal_all();
    if entry.kind == TestKind::Household {
        terminate_workers(state, entry, reason.as_str()).await;
    }
    let all: Vec<String> = {
        let streams = entry.streams.lock().expect("streams lock");
        streams.keys().cloned().collect()
    };
    if !all.is_empty() {
        enforce_teardown(state, entry, all, PHASE_EXIT_GRACE).await;
    }

    // An aborted test still leaves exactly one persisted record: a
    // partial result graded "incomplete".
    let mut result = TestResult::incomplete(
        entry.test_id.clone(),
        entry.kind,
        entry.client_addr.to_string(),
        0.0,
        entry.started_wall,
    );
    result.ts = Utc::now().timestamp_millis();
    let raw = serde_json::json!({
        "result": &result,
        "abort_reason": reason.as_str(),
    });
    if let Err(e) = state
        .store()
        .submit(&result, &raw.to_string())
        .await
    {
        tracing::error!(test_id = %entry.test_id, error = %e, "failed to persist aborted result");
    }

    state.broadcast_progress(ProgressEvent::Aborted {
        test_id: entry.test_id.clone(),
        reason: reason.as_str().into(),
    });
}

/// Wait out the grace for `ids` to deregister themselves, then evict the
/// rest and count them as forced teardowns.
async fn enforce_teardown(
    state: &AppState,
    entry: &Arc<TestEntry>,
    ids: Vec<String>,
    grace: Duration,
) {
    let deadline = Instant::now() + grace;
    while entry.any_remaining(&ids) && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let killed = entry.force_remove(&ids);
    if killed > 0 {
        state.count_forced_teardowns(killed as u64);
        tracing::warn!(
            test_id = %entry.test_id,
            killed,
            "forced-teardown: streams evicted after grace expiry"
        );
    }
}

/// Poll the store for the client's result until the grace or the hard
/// deadline runs out.
async fn wait_for_submission(
    state: &AppState,
    entry: &Arc<TestEntry>,
    hard_deadline: Instant,
) -> bool {
    let deadline = (Instant::now() + SUBMIT_GRACE).min(hard_deadline);
    loop {
        match state.store().contains(&entry.test_id).await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => {
                tracing::error!(test_id = %entry.test_id, error = %e, "store poll failed");
            }
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

fn cleanup(state: &AppState, entry: &Arc<TestEntry>) {
    state.tests().remove(&entry.test_id);
    state
        .by_addr()
        .remove_if(&entry.client_addr, |_, id| *id == entry.test_id);
    // Leftover registry state would violate the completed-test
    // invariant; clear defensively and count nothing (already graced).
    entry.force_clear();
}

// ── Worker fan-out (loopback HTTP) ──────────────────────────────────

/// Announce (or refresh) the test on every persona worker. `bulk_target`
/// is only attached to the bulk persona's registration.
async fn register_with_workers(state: &AppState, entry: &Arc<TestEntry>, bulk_target: Option<u64>) {
    let elapsed = entry.started_at.elapsed();
    let total = Duration::from_secs(state.config().max_test_duration_s);
    let deadline_ms = total.saturating_sub(elapsed).as_millis() as u64;

    for persona in ALL_PERSONAS {
        let body = RegisterTest {
            test_id: entry.test_id.clone(),
            client_addr: entry.client_addr.to_string(),
            deadline_ms,
            target_bps: if persona == Persona::Bulk { bulk_target } else { None },
        };
        let url = format!("{}/register", state.config().worker_url(persona));
        if let Err(e) = state.http().post(&url).json(&body).send().await {
            tracing::warn!(
                test_id = %entry.test_id,
                persona = %persona,
                error = %e,
                "worker registration failed"
            );
        }
    }
}

async fn terminate_workers(state: &AppState, entry: &Arc<TestEntry>, reason: &str) {
    for persona in ALL_PERSONAS {
        let body = TerminateTest {
            test_id: entry.test_id.clone(),
            reason: reason.to_string(),
        };
        let url = format!("{}/terminate", state.config().worker_url(persona));
        if let Err(e) = state.http().post(&url).json(&body).send().await {
            tracing::warn!(
                test_id = %entry.test_id,
                persona = %persona,
                error = %e,
                "worker terminate failed"
            );
        }
    }
}
