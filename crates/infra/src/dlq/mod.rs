//! Dead-letter queue for events that exhausted their delivery attempts.
//!
//! - `DeadLetterQueue`: bounded store with attempt tracking and manual retry
//! - `DlqStorage`: pluggable persistence seam (Postgres adapter in `postgres`)
//! - `RetryHandler`: re-delivery callback installed by the publisher or consumer

pub mod postgres;
pub mod queue;
pub mod storage;
pub mod types;

pub use postgres::PostgresDlqStorage;
pub use queue::{DeadLetterQueue, DlqError, RetryHandler};
pub use storage::{DlqStorage, DlqStorageError};
pub use types::{DlqConfig, DlqStats, FailedEvent, envelope_metadata, metadata_keys};
