//! Throughput and latency statistics.
//!
//! The worker's metric stream is built from these: a sliding-window rate
//! counter (raw counters stay authoritative), an EMA for display
//! smoothing, and bounded RTT/jitter history per connection.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Smoothing factor for the displayed throughput/jitter EMAs.
pub const EMA_ALPHA: f64 = 0.3;

/// Sliding window over which instantaneous rates are computed.
pub const RATE_WINDOW: Duration = Duration::from_secs(2);

// ── Rate counter ────────────────────────────────────────────────────

/// Windowed rate counter for computing bytes/sec.
pub struct RateCounter {
    /// Recent samples: (timestamp, byte count).
    samples: VecDeque<(Instant, u64)>,
    /// Window duration.
    window: Duration,
    /// Lifetime total, independent of the window.
    total: u64,
}

impl RateCounter {
    pub fn new(window: Duration) -> Self {
        RateCounter {
            samples: VecDeque::with_capacity(128),
            window,
            total: 0,
        }
    }

    /// Record a byte count at `now`.
    pub fn record(&mut self, now: Instant, bytes: u64) {
        self.total += bytes;
        self.samples.push_back((now, bytes));
        self.evict(now);
    }

    /// Bytes/sec over the window ending at `now`.
    pub fn rate(&mut self, now: Instant) -> f64 {
        self.evict(now);
        let sum: u64 = self.samples.iter().map(|(_, v)| v).sum();
        sum as f64 / self.window.as_secs_f64()
    }

    /// Lifetime byte total (authoritative, never windowed).
    pub fn total(&self) -> u64 {
        self.total
    }

    fn evict(&mut self, now: Instant) {
        let cutoff = now.checked_sub(self.window);
        if let Some(cutoff) = cutoff {
            while matches!(self.samples.front(), Some((t, _)) if *t < cutoff) {
                self.samples.pop_front();
            }
        }
    }
}

// ── EWMA ────────────────────────────────────────────────────────────

/// Exponentially weighted moving average.
#[derive(Debug, Clone)]
pub struct Ewma {
    /// Smoothing factor (0.0 - 1.0). Higher = more responsive.
    alpha: f64,
    value: f64,
    initialized: bool,
}

impl Ewma {
    pub fn new(alpha: f64) -> Self {
        assert!((0.0..=1.0).contains(&alpha), "alpha must be in [0, 1]");
        Ewma {
            alpha,
            value: 0.0,
            initialized: false,
        }
    }

    /// Update with a new sample and return the smoothed value.
    pub fn update(&mut self, sample: f64) -> f64 {
        if !self.initialized {
            self.value = sample;
            self.initialized = true;
        } else {
            self.value = self.alpha * sample + (1.0 - self.alpha) * self.value;
        }
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

// ── Jitter ──────────────────────────────────────────────────────────

/// RFC-3550-style interarrival jitter over RTT samples: smoothed mean
/// absolute deviation between consecutive RTTs.
#[derive(Debug, Clone)]
pub struct JitterEstimator {
    last_rtt_ms: Option<f64>,
    jitter_ms: f64,
}

impl JitterEstimator {
    pub fn new() -> Self {
        JitterEstimator {
            last_rtt_ms: None,
            jitter_ms: 0.0,
        }
    }

    pub fn update(&mut self, rtt_ms: f64) -> f64 {
        if let Some(last) = self.last_rtt_ms {
            let d = (rtt_ms - last).abs();
            self.jitter_ms += (d - self.jitter_ms) / 16.0;
        }
        self.last_rtt_ms = Some(rtt_ms);
        self.jitter_ms
    }

    pub fn value(&self) -> f64 {
        self.jitter_ms
    }
}

impl Default for JitterEstimator {
    fn default() -> Self {
        Self::new()
    }
}

// ── Latency history ─────────────────────────────────────────────────

/// Bounded history of RTT samples with percentile queries.
#[derive(Debug, Clone)]
pub struct LatencyHistory {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl LatencyHistory {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        LatencyHistory {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, rtt_ms: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(rtt_ms);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn latest(&self) -> Option<f64> {
        self.samples.back().copied()
    }

    /// Nearest-rank percentile, `p` in [0, 100].
    pub fn percentile(&self, p: f64) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let rank = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        Some(sorted[rank.min(sorted.len() - 1)])
    }

    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }
}

/// Nearest-rank percentile over an arbitrary sample slice. Used for the
/// household warmup probe (80th percentile of throughput samples).
pub fn percentile(samples: &[f64], p: f64) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
    Some(sorted[rank.min(sorted.len() - 1)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_counter_windowed_rate() {
        let mut rc = RateCounter::new(Duration::from_secs(2));
        let t0 = Instant::now();
        rc.record(t0, 1000);
        rc.record(t0 + Duration::from_millis(500), 1000);
        // 2000 bytes over a 2s window → 1000 B/s.
        let rate = rc.rate(t0 + Duration::from_millis(600));
        assert!((rate - 1000.0).abs() < 1.0, "rate {rate}");
    }

    #[test]
    fn rate_counter_evicts_old_samples() {
        let mut rc = RateCounter::new(Duration::from_secs(2));
        let t0 = Instant::now();
        rc.record(t0, 10_000);
        // 3s later the sample has left the window.
        assert_eq!(rc.rate(t0 + Duration::from_secs(3)), 0.0);
        // Lifetime total is untouched.
        assert_eq!(rc.total(), 10_000);
    }

    #[test]
    fn ewma_first_sample_sets_value() {
        let mut e = Ewma::new(0.3);
        assert_eq!(e.update(100.0), 100.0);
    }

    #[test]
    fn ewma_converges_toward_samples() {
        let mut e = Ewma::new(0.3);
        e.update(0.0);
        for _ in 0..50 {
            e.update(100.0);
        }
        assert!((e.value() - 100.0).abs() < 0.1);
    }

    #[test]
    fn ewma_smoothing_formula() {
        let mut e = Ewma::new(0.3);
        e.update(10.0);
        let v = e.update(20.0);
        assert!((v - (0.3 * 20.0 + 0.7 * 10.0)).abs() < 1e-9);
    }

    #[test]
    fn jitter_zero_for_constant_rtt() {
        let mut j = JitterEstimator::new();
        for _ in 0..10 {
            j.update(40.0);
        }
        assert_eq!(j.value(), 0.0);
    }

    #[test]
    fn jitter_grows_with_variance() {
        let mut j = JitterEstimator::new();
        for i in 0..20 {
            j.update(if i % 2 == 0 { 20.0 } else { 60.0 });
        }
        assert!(j.value() > 10.0);
    }

    #[test]
    fn latency_history_bounded() {
        let mut h = LatencyHistory::new(4);
        for i in 0..10 {
            h.push(i as f64);
        }
        assert_eq!(h.len(), 4);
        assert_eq!(h.latest(), Some(9.0));
        // Oldest surviving sample is 6.
        assert_eq!(h.percentile(0.0), Some(6.0));
    }

    #[test]
    fn percentile_nearest_rank() {
        let samples: Vec<f64> = (1..=100).map(|v| v as f64).collect();
        assert_eq!(percentile(&samples, 80.0), Some(80.0));
        assert_eq!(percentile(&samples, 0.0), Some(1.0));
        assert_eq!(percentile(&samples, 100.0), Some(100.0));
        assert_eq!(percentile(&[], 50.0), None);
    }
}
