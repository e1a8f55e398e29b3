//! Persona traffic pacing.
//!
//! Every pacer computes its next deadline from the previous deadline, not
//! from "now", so cadence never drifts across a 30-second test. The
//! connection loop sleeps until `next_deadline()`, calls `tick()`, and
//! enqueues that many payload bytes.
//!
//! Continuous fill without a target has no deadline at all — it is paced
//! purely by send-queue capacity (the saturation goal is "as fast as the
//! socket drains").

use std::time::{Duration, Instant};

use rand::rngs::SmallRng;
use rand::Rng;

use bloatmark_common::persona::TrafficProfile;

pub enum Pacer {
    Constant {
        frame_bytes: usize,
        min_interval: Duration,
        max_interval: Duration,
        next: Instant,
    },
    Burst {
        frame_bytes: usize,
        /// Gap between frames inside a burst, sized so the burst runs at
        /// the profile's peak rate.
        frame_interval: Duration,
        on: Duration,
        period: Duration,
        cycle_start: Instant,
        next: Instant,
    },
    /// Rate-capped fill (bulk persona with a measured target).
    Paced {
        frame_bytes: usize,
        frame_interval: Duration,
        next: Instant,
    },
    /// Unbounded fill: no deadline, back-pressured by the send queue.
    Fill { frame_bytes: usize },
}

impl Pacer {
    pub fn new(profile: TrafficProfile, target_bps: Option<u64>, now: Instant) -> Self {
        match profile {
            TrafficProfile::ConstantRate {
                frame_bytes,
                min_interval_ms,
                max_interval_ms,
            } => Pacer::Constant {
                frame_bytes,
                min_interval: Duration::from_millis(min_interval_ms),
                max_interval: Duration::from_millis(max_interval_ms),
                next: now,
            },
            TrafficProfile::Bursty {
                peak_bps,
                on_ms,
                off_ms,
                frame_bytes,
            } => Pacer::Burst {
                frame_bytes,
                frame_interval: rate_interval(frame_bytes, peak_bps),
                on: Duration::from_millis(on_ms),
                period: Duration::from_millis(on_ms + off_ms),
                cycle_start: now,
                next: now,
            },
            TrafficProfile::ContinuousFill { frame_bytes } => match target_bps {
                Some(bps) if bps > 0 => Pacer::Paced {
                    frame_bytes,
                    frame_interval: rate_interval(frame_bytes, bps),
                    next: now,
                },
                _ => Pacer::Fill { frame_bytes },
            },
        }
    }

    /// Whether this pacer runs on deadlines. `false` means "send whenever
    /// the queue has room".
    pub fn is_deadline_driven(&self) -> bool {
        !matches!(self, Pacer::Fill { .. })
    }

    pub fn frame_bytes(&self) -> usize {
        match self {
            Pacer::Constant { frame_bytes, .. }
            | Pacer::Burst { frame_bytes, .. }
            | Pacer::Paced { frame_bytes, .. }
            | Pacer::Fill { frame_bytes } => *frame_bytes,
        }
    }

    /// The next instant at which `tick` should run. For `Fill` this is
    /// meaningless and returns a far-future instant; the caller must not
    /// select on it.
    pub fn next_deadline(&self) -> Instant {
        match self {
            Pacer::Constant { next, .. } | Pacer::Burst { next, .. } | Pacer::Paced { next, .. } => {
                *next
            }
            Pacer::Fill { .. } => Instant::now() + Duration::from_secs(86_400),
        }
    }

    /// Advance past the current deadline and return the payload bytes to
    /// send now (0 when entering an idle window).
    pub fn tick(&mut self, rng: &mut SmallRng) -> usize {
        match self {
            Pacer::Constant {
                frame_bytes,
                min_interval,
                max_interval,
                next,
            } => {
                let jitter = rng.random_range(min_interval.as_millis()..=max_interval.as_millis());
                *next += Duration::from_millis(jitter as u64);
                *frame_bytes
            }
            Pacer::Burst {
                frame_bytes,
                frame_interval,
                on,
                period,
                cycle_start,
                next,
            } => {
                let burst_end = *cycle_start + *on;
                let bytes = if *next < burst_end { *frame_bytes } else { 0 };
                *next += *frame_interval;
                if *next >= burst_end {
                    // Idle window; resume at the top of the next cycle.
                    *cycle_start += *period;
                    *next = *cycle_start;
                }
                bytes
            }
            Pacer::Paced {
                frame_bytes,
                frame_interval,
                next,
            } => {
                *next += *frame_interval;
                *frame_bytes
            }
            Pacer::Fill { frame_bytes } => *frame_bytes,
        }
    }
}

fn rate_interval(frame_bytes: usize, bps: u64) -> Duration {
    Duration::from_secs_f64(frame_bytes as f64 * 8.0 / bps as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bloatmark_common::persona::Persona;
    use rand::SeedableRng;

    /// Drive a pacer over virtual time and integrate the bytes it emits.
    fn integrate(mut pacer: Pacer, duration: Duration) -> u64 {
        let mut rng = SmallRng::seed_from_u64(7);
        let start = pacer.next_deadline();
        let end = start + duration;
        let mut total: u64 = 0;
        while pacer.next_deadline() < end {
            total += pacer.tick(&mut rng) as u64;
        }
        total
    }

    #[test]
    fn video_call_rate_within_ten_percent() {
        let pacer = Pacer::new(Persona::VideoCall.download_profile(), None, Instant::now());
        let bytes = integrate(pacer, Duration::from_secs(10));
        let bps = bytes as f64 * 8.0 / 10.0;
        let target = 2_400_000.0; // 1 KB frames at ~293/s
        assert!(
            (bps - target).abs() / target < 0.10,
            "video-call paced at {bps} bps"
        );
    }

    #[test]
    fn gaming_cadence_within_jitter_bounds() {
        let mut pacer = Pacer::new(Persona::Gaming.download_profile(), None, Instant::now());
        let mut rng = SmallRng::seed_from_u64(1);
        let mut prev = pacer.next_deadline();
        for _ in 0..200 {
            let bytes = pacer.tick(&mut rng);
            assert_eq!(bytes, 60);
            let gap = pacer.next_deadline() - prev;
            assert!(gap >= Duration::from_millis(15) && gap <= Duration::from_millis(25));
            prev = pacer.next_deadline();
        }
    }

    #[test]
    fn streaming_duty_cycle_mean_rate() {
        let pacer = Pacer::new(Persona::Streaming.download_profile(), None, Instant::now());
        // Two full 5s cycles.
        let bytes = integrate(pacer, Duration::from_secs(10));
        let bps = bytes as f64 * 8.0 / 10.0;
        // 25 Mbps × 1s-on/5s-period → 5 Mbps mean.
        assert!(
            (bps - 5_000_000.0).abs() / 5_000_000.0 < 0.10,
            "streaming mean {bps} bps"
        );
    }

    #[test]
    fn streaming_goes_idle_between_bursts() {
        let mut pacer = Pacer::new(Persona::Streaming.download_profile(), None, Instant::now());
        let mut rng = SmallRng::seed_from_u64(1);
        let mut deadlines = Vec::new();
        for _ in 0..200 {
            pacer.tick(&mut rng);
            deadlines.push(pacer.next_deadline());
        }
        // There must be a jump of ~4s somewhere (the off window).
        let max_gap = deadlines
            .windows(2)
            .map(|w| w[1].saturating_duration_since(w[0]))
            .max()
            .unwrap();
        assert!(max_gap > Duration::from_secs(3), "no idle window observed");
    }

    #[test]
    fn bulk_with_target_paces_to_target() {
        let pacer = Pacer::new(
            Persona::Bulk.download_profile(),
            Some(80_000_000),
            Instant::now(),
        );
        assert!(pacer.is_deadline_driven());
        let bytes = integrate(pacer, Duration::from_secs(5));
        let bps = bytes as f64 * 8.0 / 5.0;
        assert!(
            (bps - 80_000_000.0).abs() / 80_000_000.0 < 0.10,
            "bulk paced at {bps} bps"
        );
    }

    #[test]
    fn bulk_without_target_is_queue_driven() {
        let pacer = Pacer::new(Persona::Bulk.download_profile(), None, Instant::now());
        assert!(!pacer.is_deadline_driven());
        assert_eq!(pacer.frame_bytes(), 65_536);
    }
}
