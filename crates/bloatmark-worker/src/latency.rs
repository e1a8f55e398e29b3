//! Per-connection latency probing.
//!
//! The worker owns the ping cadence; the client only echoes. RTT is
//! measured on this worker's monotonic clock between ping send and pong
//! receipt, so no cross-process clock comparison ever happens. Loss is
//! inferred two ways: a pong for seq N retires every outstanding probe
//! below N as lost (sequence gap), and a periodic sweep expires probes
//! that outlived their answer window.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use bloatmark_common::protocol::ServerFrame;
use bloatmark_common::stats::{JitterEstimator, LatencyHistory};

/// Outstanding probes older than this are swept as lost.
const PING_EXPIRY: Duration = Duration::from_secs(3);

/// RTT samples kept for percentile queries.
const HISTORY_DEPTH: usize = 1024;

#[derive(Debug, PartialEq, Eq)]
pub enum PongError {
    /// The pong's sequence number was already acknowledged — the client
    /// is replaying or reordering beyond what the transport permits.
    SequenceRegression { seq: u32, highest: u32 },
}

pub struct PingTracker {
    next_seq: u32,
    /// seq → (wire ts, send instant) for unanswered probes.
    outstanding: BTreeMap<u32, (f64, Instant)>,
    highest_pong: Option<u32>,
    history: LatencyHistory,
    jitter: JitterEstimator,
    total_sent: u64,
    lost: u64,
}

impl PingTracker {
    pub fn new() -> Self {
        PingTracker {
            next_seq: 0,
            outstanding: BTreeMap::new(),
            highest_pong: None,
            history: LatencyHistory::new(HISTORY_DEPTH),
            jitter: JitterEstimator::new(),
            total_sent: 0,
            lost: 0,
        }
    }

    /// Allocate the next probe. `now_ms` is the wire timestamp
    /// (milliseconds since worker start).
    pub fn next_ping(&mut self, now_ms: f64, now: Instant) -> ServerFrame {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.total_sent += 1;
        self.outstanding.insert(seq, (now_ms, now));
        ServerFrame::Ping { ts: now_ms, seq }
    }

    /// Handle an echoed pong. Returns the RTT sample when the probe was
    /// outstanding; `Ok(None)` for an unknown-but-not-regressed seq
    /// (already swept as lost — the sample arrives too late to use).
    pub fn record_pong(&mut self, seq: u32, now: Instant) -> Result<Option<f64>, PongError> {
        if let Some(highest) = self.highest_pong {
            if seq <= highest {
                return Err(PongError::SequenceRegression { seq, highest });
            }
        }
        self.highest_pong = Some(seq);

        // Sequence gap: everything below the acknowledged seq that is
        // still outstanding was lost in transit.
        let gapped: Vec<u32> = self
            .outstanding
            .range(..seq)
            .map(|(s, _)| *s)
            .collect();
        for s in gapped {
            self.outstanding.remove(&s);
            self.lost += 1;
        }

        match self.outstanding.remove(&seq) {
            Some((_ts, sent)) => {
                let rtt_ms = now.duration_since(sent).as_secs_f64() * 1000.0;
                self.history.push(rtt_ms);
                self.jitter.update(rtt_ms);
                Ok(Some(rtt_ms))
            }
            None => Ok(None),
        }
    }

    /// Expire probes that have outlived their answer window. Returns the
    /// number newly counted as lost.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let expired: Vec<u32> = self
            .outstanding
            .iter()
            .filter(|(_, (_, sent))| now.duration_since(*sent) > PING_EXPIRY)
            .map(|(s, _)| *s)
            .collect();
        for s in &expired {
            self.outstanding.remove(s);
            self.lost += 1;
        }
        expired.len()
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn total_sent(&self) -> u64 {
        self.total_sent
    }

    pub fn rtt_ms(&self) -> f64 {
        self.history.latest().unwrap_or(0.0)
    }

    pub fn jitter_ms(&self) -> f64 {
        self.jitter.value()
    }

    pub fn loss_pct(&self) -> f64 {
        if self.total_sent == 0 {
            0.0
        } else {
            self.lost as f64 / self.total_sent as f64 * 100.0
        }
    }

    pub fn history(&self) -> &LatencyHistory {
        &self.history
    }
}

impl Default for PingTracker {
    fn default() -> Self {
        Self::new()
    }
}
