//! Queue backends with real IO.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamConsumer, RedisStreamPublisher};
