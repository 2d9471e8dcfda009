//! Retry policy, retry ledger and the retry-or-dead-letter decision.
//!
//! ## Design
//!
//! - `RetryPolicy` is pure: budget plus backoff schedule
//! - `RetryLedger` counts failures per event id, outside the queue, with a TTL
//! - `RetryDlqPolicy` increments the ledger and turns the count into a `Decision`
//!
//! Redelivery timing is owned by the lease idle timeout, not by the schedule:
//! a `Retry` decision leaves the event unacknowledged and the reclaim loop
//! brings it back. The scheduled delay is reported (and optionally slept).

pub mod decision;
pub mod ledger;
pub mod policy;
#[cfg(feature = "redis")]
pub mod redis;

pub use decision::{Decision, RetryDlqPolicy};
pub use ledger::{InMemoryRetryLedger, LedgerError, RetryLedger};
pub use policy::RetryPolicy;
#[cfg(feature = "redis")]
pub use self::redis::RedisRetryLedger;
