//! Circuit breaker over consecutive iteration failures.
//!
//! Process-scoped: the counter resets only on a successful session, never on
//! other state changes. The force flag disables the trip check for the
//! lifetime of the process.

/// Consecutive-failure counter with a fixed trip threshold.
#[derive(Debug, Clone)]
pub struct Breaker {
    threshold: u32,
    force: bool,
    consecutive_failures: u32,
}

impl Breaker {
    pub fn new(threshold: u32, force: bool) -> Self {
        Self {
            threshold,
            force,
            consecutive_failures: 0,
        }
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// True when the loop must stop before opening another session.
    pub fn tripped(&self) -> bool {
        !self.force && self.consecutive_failures >= self.threshold
    }
}
