//! Event-loop watchdog.
//!
//! Ticks every 100 ms and measures how late each tick actually fires. A
//! short stall flips `/health` to 503 until a quiet second has passed; a
//! stall over two seconds means the runtime is wedged and the process
//! exits non-zero so the supervisor respawns it.

use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;

use crate::state::WorkerState;

const TICK: Duration = Duration::from_millis(100);

/// Lateness beyond this counts as a missed scheduling budget.
const STALL_BUDGET: Duration = Duration::from_millis(300);

/// Lateness beyond this is unrecoverable: exit and let the supervisor
/// restart the process.
const FATAL_STALL: Duration = Duration::from_secs(2);

pub async fn run(state: WorkerState) {
    let mut ticker = tokio::time::interval(TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last = Instant::now();
    let mut sweep_countdown: u32 = 50;

    loop {
        ticker.tick().await;
        let now = Instant::now();
        let gap = now.duration_since(last);
        last = now;

        if gap > TICK + FATAL_STALL {
            tracing::error!(
                gap_ms = gap.as_millis() as u64,
                "event loop stalled beyond recovery, exiting for respawn"
            );
            std::process::exit(2);
        }
        if gap > TICK + STALL_BUDGET {
            tracing::warn!(gap_ms = gap.as_millis() as u64, "scheduling budget missed");
            state.note_stall();
        }
        state.beat();

        // Registration sweep every ~5s.
        sweep_countdown -= 1;
        if sweep_countdown == 0 {
            sweep_countdown = 50;
            state.sweep_registrations();
        }
    }
}
