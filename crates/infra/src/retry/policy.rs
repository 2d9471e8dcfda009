//! Retry budget and backoff schedule.

use std::time::Duration;

/// How many processing failures an event gets, and how long each retry waits.
///
/// Pure value: no IO, no clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failures at which an event is dead-lettered instead of retried.
    pub max_retries: u32,
    /// Delay before retry *n* is `backoff_schedule[n - 1]`; the last value
    /// repeats past the end.
    pub backoff_schedule: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            3,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
            ],
        )
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_schedule: Vec<Duration>) -> Self {
        Self {
            max_retries,
            backoff_schedule,
        }
    }

    /// Same delay before every retry.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self::new(max_retries, vec![delay])
    }

    /// `base * 2^(n-1)` capped at `max_delay`, one entry per allowed retry.
    pub fn exponential(max_retries: u32, base: Duration, max_delay: Duration) -> Self {
        let schedule = (0..max_retries.max(1))
            .map(|n| {
                base.checked_mul(1u32 << n.min(31))
                    .map_or(max_delay, |d| d.min(max_delay))
            })
            .collect();
        Self::new(max_retries, schedule)
    }

    /// Delay for the given failure count (1-indexed). Zero for a count of zero
    /// or an empty schedule.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let index = (retry_count as usize - 1).min(self.backoff_schedule.len().saturating_sub(1));
        self.backoff_schedule
            .get(index)
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    /// Whether an event that has failed `retry_count` times gets another try.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn explicit_schedule_with_last_value_repeating() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(9), Duration::from_secs(4));
    }

    #[test]
    fn empty_schedule_means_no_delay() {
        let policy = RetryPolicy::new(3, Vec::new());
        assert_eq!(policy.delay_for(1), Duration::ZERO);
        assert_eq!(policy.delay_for(7), Duration::ZERO);
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));

        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for(3), Duration::from_millis(500));
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_millis(1000));

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1000));
    }

    #[test]
    fn should_retry_respects_max_retries() {
        let policy = RetryPolicy::default();

        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    proptest! {
        #[test]
        fn exponential_schedule_never_decreases(
            max_retries in 1u32..40,
            base_ms in 1u64..5_000,
            cap_ms in 1u64..600_000,
        ) {
            let policy = RetryPolicy::exponential(
                max_retries,
                Duration::from_millis(base_ms),
                Duration::from_millis(cap_ms),
            );
            let mut previous = Duration::ZERO;
            for count in 1..=max_retries + 5 {
                let delay = policy.delay_for(count);
                prop_assert!(delay >= previous);
                prop_assert!(delay <= Duration::from_millis(cap_ms));
                previous = delay;
            }
        }

        #[test]
        fn counts_past_the_schedule_repeat_the_last_delay(
            schedule in proptest::collection::vec(0u64..10_000, 1..8),
            extra in 0u32..1_000,
        ) {
            let schedule: Vec<Duration> = schedule.into_iter().map(Duration::from_millis).collect();
            let last = *schedule.last().unwrap();
            let policy = RetryPolicy::new(3, schedule.clone());
            let count = schedule.len() as u32 + extra;
            prop_assert_eq!(policy.delay_for(count), last);
        }
    }
}
