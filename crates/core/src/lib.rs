//! `courier-core`: identifiers and submission context shared by the pipeline.
//!
//! This crate has no infrastructure concerns: no threads, no IO.

pub mod context;
pub mod error;
pub mod id;

pub use context::Context;
pub use error::{ContextError, IdError};
pub use id::{EventId, FailedEventId, JobId};
