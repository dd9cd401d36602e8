//! Pluggable persistence for dead-lettered events.

use std::sync::Arc;

use thiserror::Error;

use courier_core::FailedEventId;

use super::types::FailedEvent;

#[derive(Debug, Error)]
pub enum DlqStorageError {
    #[error("dlq storage backend error: {0}")]
    Backend(String),

    #[error("dlq storage encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// External store for [`FailedEvent`]s.
///
/// The dead-letter queue consults storage before its in-memory list and
/// falls back to memory when a write fails.
pub trait DlqStorage: Send + Sync {
    /// Insert or replace the entry with the same id.
    fn store(&self, event: &FailedEvent) -> Result<(), DlqStorageError>;

    fn get(&self, id: FailedEventId) -> Result<Option<FailedEvent>, DlqStorageError>;

    /// Entries in insertion order.
    fn list(&self, limit: usize, offset: usize) -> Result<Vec<FailedEvent>, DlqStorageError>;

    /// Returns whether an entry was removed.
    fn delete(&self, id: FailedEventId) -> Result<bool, DlqStorageError>;

    fn count(&self) -> Result<usize, DlqStorageError>;
}

impl<S> DlqStorage for Arc<S>
where
    S: DlqStorage + ?Sized,
{
    fn store(&self, event: &FailedEvent) -> Result<(), DlqStorageError> {
        (**self).store(event)
    }

    fn get(&self, id: FailedEventId) -> Result<Option<FailedEvent>, DlqStorageError> {
        (**self).get(id)
    }

    fn list(&self, limit: usize, offset: usize) -> Result<Vec<FailedEvent>, DlqStorageError> {
        (**self).list(limit, offset)
    }

    fn delete(&self, id: FailedEventId) -> Result<bool, DlqStorageError> {
        (**self).delete(id)
    }

    fn count(&self) -> Result<usize, DlqStorageError> {
        (**self).count()
    }
}
