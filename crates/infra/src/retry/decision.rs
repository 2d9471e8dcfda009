//! Retry-or-quarantine decisions.

use std::sync::Arc;
use std::time::Duration;

use conduit_core::EventId;

use super::ledger::{LedgerError, RetryLedger};
use super::policy::RetryPolicy;

/// What to do with an event whose pipeline run failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Leave the event unacknowledged; it comes back when its lease goes stale.
    Retry { attempt: u32, delay: Duration },
    /// The retry budget is spent; move the event to the dead-letter store.
    DeadLetter { retry_count: u32 },
}

/// Combines the pure [`RetryPolicy`] with the shared [`RetryLedger`].
#[derive(Clone)]
pub struct RetryDlqPolicy {
    policy: RetryPolicy,
    ledger: Arc<dyn RetryLedger>,
}

impl RetryDlqPolicy {
    pub fn new(policy: RetryPolicy, ledger: Arc<dyn RetryLedger>) -> Self {
        Self { policy, ledger }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn ledger(&self) -> &Arc<dyn RetryLedger> {
        &self.ledger
    }

    /// Record one more failure and decide.
    pub async fn decide(&self, event_id: &EventId) -> Result<Decision, LedgerError> {
        let count = self.ledger.increment(event_id).await?;
        if self.policy.should_retry(count) {
            Ok(Decision::Retry {
                attempt: count,
                delay: self.policy.delay_for(count),
            })
        } else {
            Ok(Decision::DeadLetter { retry_count: count })
        }
    }

    /// Forget the event's failures. Idempotent.
    pub async fn record_success(&self, event_id: &EventId) -> Result<(), LedgerError> {
        self.ledger.clear(event_id).await
    }

    /// Current failure count, for operator inspection.
    pub async fn retry_count(&self, event_id: &EventId) -> Result<Option<u32>, LedgerError> {
        self.ledger.get(event_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::ledger::InMemoryRetryLedger;

    fn policy() -> RetryDlqPolicy {
        RetryDlqPolicy::new(RetryPolicy::default(), Arc::new(InMemoryRetryLedger::default()))
    }

    #[tokio::test]
    async fn retries_below_budget_then_dead_letters() {
        let policy = policy();
        let id = EventId::new("1-0");

        assert_eq!(
            policy.decide(&id).await.unwrap(),
            Decision::Retry {
                attempt: 1,
                delay: Duration::from_secs(1)
            }
        );
        assert_eq!(
            policy.decide(&id).await.unwrap(),
            Decision::Retry {
                attempt: 2,
                delay: Duration::from_secs(2)
            }
        );
        assert_eq!(
            policy.decide(&id).await.unwrap(),
            Decision::DeadLetter { retry_count: 3 }
        );
    }

    #[tokio::test]
    async fn success_resets_the_budget() {
        let policy = policy();
        let id = EventId::new("1-0");
        policy.decide(&id).await.unwrap();
        policy.decide(&id).await.unwrap();

        policy.record_success(&id).await.unwrap();
        policy.record_success(&id).await.unwrap();
        assert_eq!(policy.retry_count(&id).await.unwrap(), None);
        assert!(matches!(
            policy.decide(&id).await.unwrap(),
            Decision::Retry { attempt: 1, .. }
        ));
    }

    #[tokio::test]
    async fn single_retry_budget_dead_letters_first_failure() {
        let policy = RetryDlqPolicy::new(
            RetryPolicy::fixed(1, Duration::from_millis(10)),
            Arc::new(InMemoryRetryLedger::default()),
        );
        assert_eq!(
            policy.decide(&EventId::new("1-0")).await.unwrap(),
            Decision::DeadLetter { retry_count: 1 }
        );
    }
}
