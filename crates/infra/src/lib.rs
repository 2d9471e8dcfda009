//! Infrastructure layer: Redis and Postgres backends, retry/dead-letter
//! handling, the model client, configuration and the orchestrator loop.

pub mod config;
pub mod conversation;
pub mod dlq;
pub mod model;
pub mod orchestrator;
pub mod retry;
pub mod stream;

/// Shared async Redis connection.
#[cfg(feature = "redis")]
pub mod redis_conn;


pub use config::{Backend, ConduitConfig, ConfigError};
pub use orchestrator::{
    Orchestrator, OrchestratorConfig, OrchestratorHandle, OrchestratorStats, ProcessOutcome,
};
