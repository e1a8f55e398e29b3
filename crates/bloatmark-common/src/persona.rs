//! The closed persona set for the virtual-household test.
//!
//! Each persona is a stereotyped household application: its DSCP marking,
//! ping cadence, downstream traffic profile, and the latency-delta
//! thresholds its sub-grade is computed from. The set is static — workers
//! are spawned one-per-persona and everything here is compile-time data.

use serde::{Deserialize, Serialize};

use crate::grading::GradeThresholds;

// ── Persona ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Persona {
    Gaming,
    VideoCall,
    Streaming,
    Bulk,
}

/// All personas, in worker-spawn order.
pub const ALL_PERSONAS: [Persona; 4] = [
    Persona::Gaming,
    Persona::VideoCall,
    Persona::Streaming,
    Persona::Bulk,
];

impl Persona {
    pub fn as_str(&self) -> &'static str {
        match self {
            Persona::Gaming => "gaming",
            Persona::VideoCall => "video-call",
            Persona::Streaming => "streaming",
            Persona::Bulk => "bulk",
        }
    }

    /// Differentiated-services marking for this persona's traffic.
    ///
    /// Set best-effort on the worker's listener; downstream equipment is
    /// free to strip it.
    pub fn dscp(&self) -> Dscp {
        match self {
            Persona::Gaming => Dscp::Ef,
            Persona::VideoCall => Dscp::Af41,
            Persona::Streaming => Dscp::Af31,
            Persona::Bulk => Dscp::Be,
        }
    }

    /// Interval between server-initiated latency probes.
    pub fn ping_interval_ms(&self) -> u64 {
        match self {
            Persona::Gaming => 50,
            Persona::VideoCall => 100,
            Persona::Streaming => 200,
            Persona::Bulk => 1000,
        }
    }

    /// Downstream traffic profile the worker generates on each connection.
    pub fn download_profile(&self) -> TrafficProfile {
        match self {
            // Small frames on a jittered 15-25ms cadence, like game state
            // updates. The nominal rate target is in `down_target_bps`.
            Persona::Gaming => TrafficProfile::ConstantRate {
                frame_bytes: 60,
                min_interval_ms: 15,
                max_interval_ms: 25,
            },
            // ~300 1KB frames/s ≈ 2.4 Mbps, conferencing-shaped.
            Persona::VideoCall => TrafficProfile::ConstantRate {
                frame_bytes: 1024,
                min_interval_ms: 3,
                max_interval_ms: 4,
            },
            // ABR-player-shaped: fill the buffer for 1s, idle for 4s.
            Persona::Streaming => TrafficProfile::Bursty {
                peak_bps: 25_000_000,
                on_ms: 1_000,
                off_ms: 4_000,
                frame_bytes: 65_536,
            },
            Persona::Bulk => TrafficProfile::ContinuousFill {
                frame_bytes: 65_536,
            },
        }
    }

    /// Nominal downstream rate for display and grading context.
    pub fn down_target_bps(&self) -> u64 {
        match self {
            Persona::Gaming => 1_500_000,
            Persona::VideoCall => 2_500_000,
            Persona::Streaming => 25_000_000,
            // Bulk has no fixed target: continuous fill, or the measured
            // 80th-percentile rate from the household warmup probe.
            Persona::Bulk => 0,
        }
    }

    /// Nominal upstream rate the client is expected to generate.
    pub fn up_target_bps(&self) -> u64 {
        match self {
            Persona::Gaming => 750_000,
            Persona::VideoCall => 2_500_000,
            Persona::Streaming => 100_000,
            Persona::Bulk => 100_000,
        }
    }

    /// Latency-delta thresholds for this persona's sub-grade.
    pub fn grade_thresholds(&self) -> GradeThresholds {
        match self {
            Persona::Gaming => GradeThresholds::new(25.0, 75.0, 150.0),
            Persona::VideoCall => GradeThresholds::new(50.0, 150.0, 300.0),
            Persona::Streaming => GradeThresholds::new(100.0, 300.0, 600.0),
            Persona::Bulk => GradeThresholds::new(200.0, 1000.0, 5000.0),
        }
    }

    /// Whether this persona's sub-grade contributes to the household
    /// overall grade. Streaming and bulk tolerate high latency and are
    /// intentionally excluded.
    pub fn counts_toward_overall(&self) -> bool {
        matches!(self, Persona::Gaming | Persona::VideoCall)
    }

    /// Default listener port for this persona's worker process.
    pub fn default_port(&self) -> u16 {
        match self {
            Persona::Gaming => 8002,
            Persona::VideoCall => 8003,
            Persona::Streaming => 8001,
            Persona::Bulk => 8004,
        }
    }
}

impl std::fmt::Display for Persona {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Persona {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gaming" => Ok(Persona::Gaming),
            // "video" is the short form used in the port-map env var.
            "video-call" | "video" | "video_call" => Ok(Persona::VideoCall),
            "streaming" => Ok(Persona::Streaming),
            "bulk" => Ok(Persona::Bulk),
            other => Err(format!("unknown persona: {other}")),
        }
    }
}

// ── DSCP ────────────────────────────────────────────────────────────

/// Differentiated-services class, as the 6-bit DSCP codepoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dscp {
    /// Expedited forwarding (46).
    Ef,
    /// Assured forwarding 4/1 (34).
    Af41,
    /// Assured forwarding 3/1 (26).
    Af31,
    /// Best effort (0).
    Be,
}

impl Dscp {
    /// The codepoint shifted into TOS-byte position for `IP_TOS`.
    pub fn tos_byte(&self) -> u8 {
        let codepoint: u8 = match self {
            Dscp::Ef => 46,
            Dscp::Af41 => 34,
            Dscp::Af31 => 26,
            Dscp::Be => 0,
        };
        codepoint << 2
    }
}

// ── Traffic profile ─────────────────────────────────────────────────

/// Shape of a persona's server-initiated downstream traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrafficProfile {
    /// Fixed-size frames on a (possibly jittered) cadence.
    ConstantRate {
        frame_bytes: usize,
        min_interval_ms: u64,
        max_interval_ms: u64,
    },
    /// Full-rate bursts separated by idle periods.
    Bursty {
        peak_bps: u64,
        on_ms: u64,
        off_ms: u64,
        frame_bytes: usize,
    },
    /// Saturate the downlink, optionally capped by a measured target.
    ContinuousFill { frame_bytes: usize },
}

impl TrafficProfile {
    /// Size of the frames this profile emits.
    pub fn frame_bytes(&self) -> usize {
        match self {
            TrafficProfile::ConstantRate { frame_bytes, .. }
            | TrafficProfile::Bursty { frame_bytes, .. }
            | TrafficProfile::ContinuousFill { frame_bytes } => *frame_bytes,
        }
    }

    /// Mean rate of the profile over one full period, in bits/s.
    /// `ContinuousFill` has no intrinsic rate and returns `None`.
    pub fn mean_bps(&self) -> Option<f64> {
        match self {
            TrafficProfile::ConstantRate {
                frame_bytes,
                min_interval_ms,
                max_interval_ms,
            } => {
                let mean_interval_s = (*min_interval_ms + *max_interval_ms) as f64 / 2.0 / 1000.0;
                Some(*frame_bytes as f64 * 8.0 / mean_interval_s)
            }
            TrafficProfile::Bursty {
                peak_bps,
                on_ms,
                off_ms,
                ..
            } => {
                let duty = *on_ms as f64 / (*on_ms + *off_ms) as f64;
                Some(*peak_bps as f64 * duty)
            }
            TrafficProfile::ContinuousFill { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persona_round_trip_names() {
        for p in ALL_PERSONAS {
            let parsed: Persona = p.as_str().parse().unwrap();
            assert_eq!(parsed, p);
        }
    }

    #[test]
    fn video_short_form_parses() {
        assert_eq!("video".parse::<Persona>().unwrap(), Persona::VideoCall);
    }

    #[test]
    fn unknown_persona_rejected() {
        assert!("torrent".parse::<Persona>().is_err());
    }

    #[test]
    fn dscp_tos_bytes() {
        assert_eq!(Dscp::Ef.tos_byte(), 46 << 2);
        assert_eq!(Dscp::Be.tos_byte(), 0);
    }

    #[test]
    fn default_ports_are_distinct() {
        let mut ports: Vec<u16> = ALL_PERSONAS.iter().map(|p| p.default_port()).collect();
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), 4);
    }

    #[test]
    fn video_call_profile_close_to_target() {
        let mean = Persona::VideoCall.download_profile().mean_bps().unwrap();
        let target = Persona::VideoCall.down_target_bps() as f64;
        // 1KB frames every 3-4ms ≈ 2.34 Mbps, within 10% of 2.5 Mbps.
        assert!((mean - target).abs() / target < 0.10, "mean {mean}");
    }

    #[test]
    fn streaming_profile_duty_cycle() {
        let mean = Persona::Streaming.download_profile().mean_bps().unwrap();
        // 25 Mbps at 1s-on/4s-off → 5 Mbps mean.
        assert!((mean - 5_000_000.0).abs() < 1.0);
    }

    #[test]
    fn overall_grade_uses_latency_sensitive_personas_only() {
        assert!(Persona::Gaming.counts_toward_overall());
        assert!(Persona::VideoCall.counts_toward_overall());
        assert!(!Persona::Streaming.counts_toward_overall());
        assert!(!Persona::Bulk.counts_toward_overall());
    }
}
