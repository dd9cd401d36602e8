//! Relay wiring: forwards consumed events to the topics they are routed to
//! and periodically logs pipeline statistics.

pub mod forward;
pub mod stats;

pub use forward::Forwarder;
pub use stats::{PipelineSnapshot, spawn_stats_reporter};
