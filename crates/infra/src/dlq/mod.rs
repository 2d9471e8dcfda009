//! Dead-letter store and operator actions.
//!
//! ## Components
//!
//! - `DeadLetterEntry`: the quarantined event plus the failure that put it here
//! - `DeadLetterStore`: durable storage, idempotent per original event id
//! - `DeadLetterOperator`: list / inspect / delete / purge / requeue

pub mod entry;
pub mod operator;
#[cfg(feature = "redis")]
pub mod redis;
pub mod store;

pub use entry::{DeadLetterEntry, DeadLetterFilter};
pub use operator::{DeadLetterOperator, OperatorError};
#[cfg(feature = "redis")]
pub use self::redis::RedisDeadLetterStore;
pub use store::{DeadLetterError, DeadLetterStore, InMemoryDeadLetterStore};
