//! Exponential backoff capped at the monitor period (§4.4).
//!
//! A pure value type so the bound (property 5: delay is monotonically
//! non-decreasing up to its cap, and never exceeds `mp`) is testable
//! without a running loop.

use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    initial: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, cap: Duration) -> Self {
        Backoff {
            initial,
            cap,
            current: initial,
        }
    }

    /// Delay for the monitor period, capped per §4.4 ("Backoff is capped
    /// at `mp` seconds so that a polling device never stalls longer than
    /// one monitor period").
    pub fn for_monitor_period(monitor_period: Duration) -> Self {
        Backoff::new(Duration::from_secs(5), monitor_period)
    }

    /// Return the delay to wait before the next retry, then double it
    /// (capped) for the following call. Clamped to `cap` even on the
    /// first call, so a cap smaller than `initial` (a monitor period
    /// under 5s) is still honored.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.cap);
        self.current = delay.saturating_mul(2).min(self.cap);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial.min(self.cap);
    }
}
