//! Broker adapters beyond the in-memory one in `courier-events`.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsBroker, RedisStreamsConfig, RedisStreamsError};
