//! Monotonic time-boxing and backoff for a single poll window. The clock is injectable so
//! tests can synthesize elapsed time without sleeping.

use std::time::{Duration, Instant};

/// A function returning "now". Defaults to [`Instant::now`]; tests inject a fake clock.
pub type ClockFn = std::sync::Arc<dyn Fn() -> Instant + Send + Sync>;

fn real_clock() -> ClockFn {
    std::sync::Arc::new(Instant::now)
}

/// Tracks a time budget for one operation (one `batch_poll` call) plus exponential backoff
/// state for retries within that operation.
#[derive(Clone)]
pub struct TimeTracker {
    clock: ClockFn,
    start: Instant,
    budget: Duration,
    attempt: u32,
}

impl TimeTracker {
    /// Start a new tracker with the given total time budget, using the real clock.
    pub fn start(budget: Duration) -> Self {
        Self::start_with_clock(budget, real_clock())
    }

    /// Start a new tracker with an injected clock, for deterministic tests.
    pub fn start_with_clock(budget: Duration, clock: ClockFn) -> Self {
        let start = clock();
        Self {
            clock,
            start,
            budget,
            attempt: 0,
        }
    }

    /// Time elapsed since `start`.
    pub fn elapsed(&self) -> Duration {
        (self.clock)().saturating_duration_since(self.start)
    }

    /// Time remaining in the budget; zero once exhausted.
    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.elapsed())
    }

    /// True once the budget is exhausted.
    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Record a checkpoint (an attempt happened); used to drive the retry counter.
    pub fn checkpoint(&mut self) {
        self.attempt = self.attempt.saturating_add(1);
    }

    /// Number of checkpoints recorded so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Exponential backoff for the current attempt count, capped at `max`. Doubles per
    /// attempt starting from `base`.
    pub fn backoff(&self, base: Duration, max: Duration) -> Duration {
        let shift = self.attempt.min(16);
        let factor = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
        let scaled = base.as_millis().saturating_mul(u128::from(factor));
        let capped = scaled.min(max.as_millis());
        Duration::from_millis(u64::try_from(capped).unwrap_or(u64::MAX))
    }
}
