//! Durable stream consumption mechanics (consumer groups, leases, acknowledgment).
//!
//! This crate owns everything that talks to the queue and nothing that knows
//! what an event *means*:
//!
//! - [`StreamConsumer`]: read / ack / reclaim-stale contract for one consumer in a group
//! - [`Publisher`]: append a fresh event to a named stream
//! - [`LeaseManager`]: background stale-lease reclamation feeding `read()`
//! - [`InMemoryStreams`]: in-process broker with consumer-group semantics (tests/dev)
//! - [`TransportBackoff`]: short capped backoff for connection-level failures
//!
//! Backends with real IO (Redis Streams) live in `conduit-infra`.

pub mod backoff;
pub mod consumer;
pub mod delivery;
pub mod error;
pub mod in_memory;
pub mod lease;

pub use backoff::TransportBackoff;
pub use consumer::{Publisher, StreamConsumer};
pub use delivery::{AckOutcome, Delivery, StreamDepth};
pub use error::TransportError;
pub use in_memory::{InMemoryConsumer, InMemoryStreams, PendingInfo};
pub use lease::{LeaseConfig, LeaseManager, ReclaimHandle};
