//! Backoff controllers for the dispatch loop.
//!
//! Two independent curves live here:
//!
//! - [`PollBackoff`] spaces out history polls for a single submitted job
//!   (1 s, doubling, capped at 10 s, at most 600 attempts).
//! - [`AdaptivePollInterval`] is the process-wide sleep between dispatch
//!   cycles. It doubles when a cycle fails and snaps back to its base after
//!   a fully successful cycle.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Per-job poll backoff
// ---------------------------------------------------------------------------

/// Delay before the second history poll.
pub const DEFAULT_POLL_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Upper bound on the delay between history polls.
pub const DEFAULT_POLL_MAX_DELAY: Duration = Duration::from_secs(10);

/// Hard ceiling on history polls for one job.
pub const DEFAULT_POLL_MAX_ATTEMPTS: u32 = 600;

/// Tunable parameters for the history poll curve.
#[derive(Debug, Clone, PartialEq)]
pub struct PollBackoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for PollBackoff {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_POLL_INITIAL_DELAY,
            max_delay: DEFAULT_POLL_MAX_DELAY,
            multiplier: 2.0,
            max_attempts: DEFAULT_POLL_MAX_ATTEMPTS,
        }
    }
}

impl PollBackoff {
    /// Grow `current` by the multiplier, clamped to `max_delay`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        let next_ms = (current.as_millis() as f64 * self.multiplier) as u64;
        Duration::from_millis(next_ms).min(self.max_delay)
    }

    /// The full sequence of sleeps between consecutive polls.
    ///
    /// There is one fewer sleep than attempts: the loop gives up right after
    /// the last attempt instead of sleeping again.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let count = self.max_attempts.saturating_sub(1) as usize;
        std::iter::successors(Some(self.initial_delay.min(self.max_delay)), move |d| {
            Some(self.next_delay(*d))
        })
        .take(count)
    }
}

// ---------------------------------------------------------------------------
// Process-wide idle interval
// ---------------------------------------------------------------------------

/// Ceiling on the sleep between dispatch cycles.
pub const MAX_IDLE_INTERVAL: Duration = Duration::from_secs(30);

/// Sleep between dispatch cycles, bounded to `[base, MAX_IDLE_INTERVAL]`.
///
/// Escalation is capped at once per cycle: callers open a cycle with
/// [`begin_cycle`](Self::begin_cycle) and any number of failures inside it
/// double the interval exactly once.
#[derive(Debug, Clone)]
pub struct AdaptivePollInterval {
    base: Duration,
    current: Duration,
    escalated_this_cycle: bool,
}

impl AdaptivePollInterval {
    /// A base above the ceiling is clamped to it.
    pub fn new(base: Duration) -> Self {
        let base = base.min(MAX_IDLE_INTERVAL);
        Self {
            base,
            current: base,
            escalated_this_cycle: false,
        }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Start a new dispatch cycle, re-arming escalation.
    pub fn begin_cycle(&mut self) {
        self.escalated_this_cycle = false;
    }

    /// Record a failure. Doubles the interval at most once per cycle and
    /// returns whether this call changed it.
    pub fn escalate(&mut self) -> bool {
        if self.escalated_this_cycle {
            return false;
        }
        self.escalated_this_cycle = true;

        // A zero base would never grow; step to one second instead.
        let doubled = if self.current.is_zero() {
            Duration::from_secs(1)
        } else {
            self.current.saturating_mul(2)
        };
        let next = doubled.clamp(self.base, MAX_IDLE_INTERVAL);
        let changed = next != self.current;
        self.current = next;
        changed
    }

    /// Return to the base interval after a fully successful cycle.
    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
