//! Test lifecycle data model: kinds, phases, phase plans, and the
//! persisted result record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Test kind ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestKind {
    Single,
    Household,
}

impl TestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestKind::Single => "single",
            TestKind::Household => "household",
        }
    }
}

impl std::fmt::Display for TestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TestKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" | "single-user" => Ok(TestKind::Single),
            "household" => Ok(TestKind::Household),
            other => Err(format!("unknown test kind: {other}")),
        }
    }
}

// ── Phases ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseKind {
    // Single-user sequence.
    Baseline,
    DownloadWarmup,
    DownloadSaturation,
    UploadWarmup,
    UploadSaturation,
    Bidirectional,
    // Household sequence.
    Warmup,
    Saturation,
    // Terminal for both.
    Complete,
}

impl PhaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseKind::Baseline => "baseline",
            PhaseKind::DownloadWarmup => "download-warmup",
            PhaseKind::DownloadSaturation => "download-saturation",
            PhaseKind::UploadWarmup => "upload-warmup",
            PhaseKind::UploadSaturation => "upload-saturation",
            PhaseKind::Bidirectional => "bidirectional",
            PhaseKind::Warmup => "warmup",
            PhaseKind::Saturation => "saturation",
            PhaseKind::Complete => "complete",
        }
    }

    /// Whether a bulk stream of `kind` may be active for a test currently
    /// in this phase. Baseline is strictly unloaded.
    pub fn allows(&self, kind: StreamKind) -> bool {
        match self {
            PhaseKind::Baseline | PhaseKind::Complete | PhaseKind::Saturation => false,
            PhaseKind::DownloadWarmup | PhaseKind::DownloadSaturation | PhaseKind::Warmup => {
                kind == StreamKind::Download
            }
            PhaseKind::UploadWarmup | PhaseKind::UploadSaturation => kind == StreamKind::Upload,
            PhaseKind::Bidirectional => true,
        }
    }
}

impl std::fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Download,
    Upload,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Download => "download",
            StreamKind::Upload => "upload",
        }
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One timed segment of a phase plan. Offsets are relative to test start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSlot {
    pub phase: PhaseKind,
    pub start_ms: u64,
    pub end_ms: u64,
    /// Stream concurrency the client should run during this slot.
    pub target_download_streams: u32,
    pub target_upload_streams: u32,
}

/// The single-user phase plan:
/// baseline 5s → dl-warmup 5s → dl-saturation 10s → ul-warmup 5s →
/// ul-saturation 10s → bidirectional 5s. Slots are strictly monotonic
/// and cover [0, duration] with no gaps.
pub fn single_user_plan() -> Vec<PhaseSlot> {
    let slot = |phase, start_ms, end_ms, dl, ul| PhaseSlot {
        phase,
        start_ms,
        end_ms,
        target_download_streams: dl,
        target_upload_streams: ul,
    };
    vec![
        slot(PhaseKind::Baseline, 0, 5_000, 0, 0),
        slot(PhaseKind::DownloadWarmup, 5_000, 10_000, 1, 0),
        slot(PhaseKind::DownloadSaturation, 10_000, 20_000, 4, 0),
        slot(PhaseKind::UploadWarmup, 20_000, 25_000, 0, 1),
        slot(PhaseKind::UploadSaturation, 25_000, 35_000, 0, 3),
        slot(PhaseKind::Bidirectional, 35_000, 40_000, 2, 2),
    ]
}

/// The household plan: a 5s speed probe, then 30s of persona saturation.
pub fn household_plan() -> Vec<PhaseSlot> {
    vec![
        PhaseSlot {
            phase: PhaseKind::Warmup,
            start_ms: 0,
            end_ms: 5_000,
            target_download_streams: 4,
            target_upload_streams: 0,
        },
        PhaseSlot {
            phase: PhaseKind::Saturation,
            start_ms: 5_000,
            end_ms: 35_000,
            target_download_streams: 0,
            target_upload_streams: 0,
        },
    ]
}

pub fn plan_for(kind: TestKind) -> Vec<PhaseSlot> {
    match kind {
        TestKind::Single => single_user_plan(),
        TestKind::Household => household_plan(),
    }
}

/// Total planned duration in ms (excludes the grace windows after
/// `complete`).
pub fn plan_duration_ms(plan: &[PhaseSlot]) -> u64 {
    plan.last().map(|s| s.end_ms).unwrap_or(0)
}

// ── Test state ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestState {
    Running,
    Complete,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AbortReason {
    ClientGone,
    WorkerRestart,
    DeadlineExceeded,
    NoSubmission,
    OperatorShutdown,
}

impl AbortReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbortReason::ClientGone => "client-gone",
            AbortReason::WorkerRestart => "worker-restart",
            AbortReason::DeadlineExceeded => "deadline-exceeded",
            AbortReason::NoSubmission => "no-submission",
            AbortReason::OperatorShutdown => "operator-shutdown",
        }
    }
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Test result ─────────────────────────────────────────────────────

/// The immutable record of a finished test. The client submits this as
/// JSON; `client_addr` and `ts` are stamped server-side at the trust
/// boundary and anything the client put there is overwritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub test_id: String,
    pub kind: TestKind,
    #[serde(default)]
    pub client_addr: String,
    /// Letter grade, or `"incomplete"` for aborted tests.
    pub grade: String,
    pub baseline_rtt_ms: f64,
    pub loaded_rtt_ms: f64,
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub duration_s: f64,
    /// Unix milliseconds, stamped at submit.
    #[serde(default)]
    pub ts: i64,
}

impl TestResult {
    /// Schema-level validation for submitted results.
    pub fn validate(&self) -> Result<(), String> {
        if !crate::ids::valid_test_id(&self.test_id) {
            return Err("invalid test_id".into());
        }
        const GRADES: [&str; 7] = ["A+", "A", "B", "C", "D", "F", "incomplete"];
        if !GRADES.contains(&self.grade.as_str()) {
            return Err(format!("invalid grade: {}", self.grade));
        }
        for (name, v) in [
            ("baseline_rtt_ms", self.baseline_rtt_ms),
            ("loaded_rtt_ms", self.loaded_rtt_ms),
            ("download_mbps", self.download_mbps),
            ("upload_mbps", self.upload_mbps),
            ("duration_s", self.duration_s),
        ] {
            if !v.is_finite() || v < 0.0 {
                return Err(format!("invalid {name}: {v}"));
            }
        }
        Ok(())
    }

    /// Partial result for a test that never completed.
    pub fn incomplete(
        test_id: String,
        kind: TestKind,
        client_addr: String,
        baseline_rtt_ms: f64,
        started_at: DateTime<Utc>,
    ) -> Self {
        TestResult {
            test_id,
            kind,
            client_addr,
            grade: "incomplete".into(),
            baseline_rtt_ms,
            loaded_rtt_ms: 0.0,
            download_mbps: 0.0,
            upload_mbps: 0.0,
            duration_s: (Utc::now() - started_at).num_milliseconds().max(0) as f64 / 1000.0,
            ts: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_plan_covers_duration_without_gaps() {
        let plan = single_user_plan();
        assert_eq!(plan[0].start_ms, 0);
        for pair in plan.windows(2) {
            assert_eq!(pair[0].end_ms, pair[1].start_ms, "gap or overlap in plan");
            assert!(pair[0].start_ms < pair[1].start_ms, "offsets not monotonic");
        }
        assert_eq!(plan_duration_ms(&plan), 40_000);
    }

    #[test]
    fn single_plan_phase_order() {
        let phases: Vec<PhaseKind> = single_user_plan().iter().map(|s| s.phase).collect();
        assert_eq!(
            phases,
            vec![
                PhaseKind::Baseline,
                PhaseKind::DownloadWarmup,
                PhaseKind::DownloadSaturation,
                PhaseKind::UploadWarmup,
                PhaseKind::UploadSaturation,
                PhaseKind::Bidirectional,
            ]
        );
    }

    #[test]
    fn household_plan_durations() {
        let plan = household_plan();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[1].end_ms - plan[1].start_ms, 30_000);
    }

    #[test]
    fn baseline_is_unloaded() {
        assert!(!PhaseKind::Baseline.allows(StreamKind::Download));
        assert!(!PhaseKind::Baseline.allows(StreamKind::Upload));
    }

    #[test]
    fn saturation_phases_gate_stream_kinds() {
        assert!(PhaseKind::DownloadSaturation.allows(StreamKind::Download));
        assert!(!PhaseKind::DownloadSaturation.allows(StreamKind::Upload));
        assert!(PhaseKind::UploadSaturation.allows(StreamKind::Upload));
        assert!(!PhaseKind::UploadSaturation.allows(StreamKind::Download));
        assert!(PhaseKind::Bidirectional.allows(StreamKind::Download));
        assert!(PhaseKind::Bidirectional.allows(StreamKind::Upload));
    }

    #[test]
    fn result_validation_rejects_bad_grade() {
        let mut r = TestResult {
            test_id: "abcdef0123456789".into(),
            kind: TestKind::Single,
            client_addr: String::new(),
            grade: "A".into(),
            baseline_rtt_ms: 12.0,
            loaded_rtt_ms: 40.0,
            download_mbps: 250.0,
            upload_mbps: 40.0,
            duration_s: 40.0,
            ts: 0,
        };
        assert!(r.validate().is_ok());
        r.grade = "Z".into();
        assert!(r.validate().is_err());
    }

    #[test]
    fn result_validation_rejects_non_finite_numbers() {
        let r = TestResult {
            test_id: "abcdef0123456789".into(),
            kind: TestKind::Household,
            client_addr: String::new(),
            grade: "B".into(),
            baseline_rtt_ms: f64::NAN,
            loaded_rtt_ms: 40.0,
            download_mbps: 1.0,
            upload_mbps: 1.0,
            duration_s: 35.0,
            ts: 0,
        };
        assert!(r.validate().is_err());
    }

    #[test]
    fn kind_round_trip() {
        assert_eq!("single".parse::<TestKind>().unwrap(), TestKind::Single);
        assert_eq!(
            "household".parse::<TestKind>().unwrap(),
            TestKind::Household
        );
        assert!("both".parse::<TestKind>().is_err());
    }
}
