//! Readiness watchdog
//!
//! Counts scheduler ticks until the consumer registers. Reaching the threshold
//! fires once and the watchdog goes inert; registration cancels it for good.

/// Watchdog lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    Counting(u32),
    Fired,
    Cancelled,
}

pub struct ReadinessWatchdog {
    state: WatchdogState,
    threshold: u32,
}

impl ReadinessWatchdog {
    pub fn new(threshold: u32) -> Self {
        Self {
            state: WatchdogState::Counting(0),
            threshold,
        }
    }

    /// Count one tick without a consumer
    ///
    /// Returns true exactly once, on the tick that reaches the threshold.
    pub fn advance(&mut self) -> bool {
        if let WatchdogState::Counting(n) = self.state {
            let n = n + 1;
            if n >= self.threshold {
                self.state = WatchdogState::Fired;
                return true;
            }
            self.state = WatchdogState::Counting(n);
        }
        false
    }

    /// Consumer registered; no-op once fired
    pub fn cancel(&mut self) {
        if matches!(self.state, WatchdogState::Counting(_)) {
            self.state = WatchdogState::Cancelled;
        }
    }

    pub fn state(&self) -> WatchdogState {
        self.state
    }
}
