//! Error types shared by every pipeline crate.

use thiserror::Error;

/// An identifier failed to parse.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("invalid {kind}: {reason}")]
    Invalid { kind: &'static str, reason: String },
}

/// Why a [`Context`](crate::Context) no longer admits new work.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ContextError {
    /// The context was cancelled explicitly.
    #[error("context cancelled")]
    Cancelled,

    /// The context deadline has passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}
