//! Transport-level backoff.

use std::time::Duration;

/// Capped exponential backoff for connection-level failures.
///
/// Separate from the message retry policy: transport failures are retried
/// here, indefinitely, and never consume a message's retry budget.
#[derive(Debug, Clone)]
pub struct TransportBackoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Default for TransportBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(5))
    }
}

impl TransportBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            attempt: 0,
        }
    }

    /// Delay before the next attempt: `initial * 2^n`, capped at `max`.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.attempt.min(16);
        self.attempt = self.attempt.saturating_add(1);
        self.initial
            .checked_mul(1u32 << exp)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Number of consecutive failures seen since the last reset.
    pub fn failures(&self) -> u32 {
        self.attempt
    }

    /// Call after a successful operation.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
