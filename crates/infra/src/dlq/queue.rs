use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::Utc;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info, warn};

use courier_core::FailedEventId;

use super::storage::{DlqStorage, DlqStorageError};
use super::types::{DlqConfig, DlqStats, FailedEvent};

#[derive(Debug, Error)]
pub enum DlqError {
    #[error("failed event {0} not found")]
    NotFound(FailedEventId),

    #[error("dead letter queue is full ({max_size} entries)")]
    QueueFull { max_size: usize },

    #[error("failed event {id} exhausted its retries ({attempts}/{max_attempts})")]
    MaxAttemptsExceeded {
        id: FailedEventId,
        attempts: u32,
        max_attempts: u32,
    },

    #[error("no retry handler installed")]
    NoRetryHandler,

    #[error("failed event {0} is already being retried")]
    RetryInProgress(FailedEventId),

    #[error("retry of failed event {id} failed: {reason}")]
    RetryFailed { id: FailedEventId, reason: String },

    #[error(transparent)]
    Storage(#[from] DlqStorageError),
}

/// Re-delivers a dead-lettered event.
pub trait RetryHandler: Send + Sync {
    fn retry(&self, event: &FailedEvent) -> anyhow::Result<()>;
}

impl<F> RetryHandler for F
where
    F: Fn(&FailedEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn retry(&self, event: &FailedEvent) -> anyhow::Result<()> {
        self(event)
    }
}

/// Bounded holding area for events that exhausted their delivery attempts.
///
/// Entries live in the configured [`DlqStorage`] when there is one, otherwise
/// (or when a storage write fails) in an ordered in-memory list. Reads look
/// at storage first, then memory. Callers only ever receive clones.
pub struct DeadLetterQueue {
    config: DlqConfig,
    memory: Mutex<Vec<FailedEvent>>,
    storage: Option<Arc<dyn DlqStorage>>,
    retry_handler: RwLock<Option<Arc<dyn RetryHandler>>>,
    /// Ids whose retry handler is currently running.
    in_flight: Mutex<HashSet<FailedEventId>>,
}

impl DeadLetterQueue {
    pub fn new(config: DlqConfig) -> Self {
        Self {
            config,
            memory: Mutex::new(Vec::new()),
            storage: None,
            retry_handler: RwLock::new(None),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_storage(config: DlqConfig, storage: Arc<dyn DlqStorage>) -> Self {
        Self {
            storage: Some(storage),
            ..Self::new(config)
        }
    }

    pub fn config(&self) -> &DlqConfig {
        &self.config
    }

    pub fn set_retry_handler(&self, handler: Arc<dyn RetryHandler>) {
        *self
            .retry_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Install `handler` unless one is already present. Returns whether it was installed.
    pub fn set_retry_handler_if_absent(&self, handler: Arc<dyn RetryHandler>) -> bool {
        let mut slot = self
            .retry_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }
        *slot = Some(handler);
        true
    }

    pub fn has_retry_handler(&self) -> bool {
        self.retry_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Dead-letter an event that did not come from a broker.
    pub fn add_event(
        &self,
        event_type: impl Into<String>,
        data: Map<String, JsonValue>,
        error: impl Into<String>,
        metadata: HashMap<String, String>,
    ) -> Result<FailedEventId, DlqError> {
        self.insert(self.new_entry(event_type.into(), data, error.into(), metadata))
    }

    /// Dead-letter an event together with its broker coordinates.
    #[allow(clippy::too_many_arguments)]
    pub fn add_broker_event(
        &self,
        event_type: impl Into<String>,
        data: Map<String, JsonValue>,
        error: impl Into<String>,
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        metadata: HashMap<String, String>,
    ) -> Result<FailedEventId, DlqError> {
        let mut entry = self.new_entry(event_type.into(), data, error.into(), metadata);
        entry.topic = Some(topic.into());
        entry.partition = Some(partition);
        entry.offset = Some(offset);
        self.insert(entry)
    }

    pub fn get_event(&self, id: FailedEventId) -> Result<FailedEvent, DlqError> {
        if let Some(storage) = &self.storage {
            match storage.get(id) {
                Ok(Some(event)) => return Ok(event),
                Ok(None) => {}
                Err(e) => warn!(%id, error = %e, "dlq storage read failed; checking memory"),
            }
        }

        self.lock_memory()
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or(DlqError::NotFound(id))
    }

    /// Page through entries: storage entries first, then in-memory ones.
    pub fn list_events(&self, limit: usize, offset: usize) -> Vec<FailedEvent> {
        let mut events = Vec::new();
        let mut skip = offset;

        if let Some(storage) = &self.storage {
            let stored = self.storage_count(&**storage);
            if skip < stored {
                match storage.list(limit, skip) {
                    Ok(page) => events = page,
                    Err(e) => warn!(error = %e, "dlq storage list failed"),
                }
            }
            skip = skip.saturating_sub(stored);
        }

        let remaining = limit.saturating_sub(events.len());
        if remaining > 0 {
            events.extend(
                self.lock_memory()
                    .iter()
                    .skip(skip)
                    .take(remaining)
                    .cloned(),
            );
        }
        events
    }

    pub fn delete_event(&self, id: FailedEventId) -> Result<(), DlqError> {
        // Held across both stores so a concurrent write-back cannot resurrect the entry.
        let mut memory = self.lock_memory();
        let mut removed = false;
        let mut storage_error = None;

        if let Some(storage) = &self.storage {
            match storage.delete(id) {
                Ok(found) => removed = found,
                Err(e) => {
                    warn!(%id, error = %e, "dlq storage delete failed; checking memory");
                    storage_error = Some(e);
                }
            }
        }

        if let Some(pos) = memory.iter().position(|e| e.id == id) {
            memory.remove(pos);
            removed = true;
        }

        match (removed, storage_error) {
            (true, _) => {
                info!(%id, "failed event deleted");
                Ok(())
            }
            (false, Some(e)) => Err(e.into()),
            (false, None) => Err(DlqError::NotFound(id)),
        }
    }

    /// Re-deliver an entry through the installed retry handler.
    ///
    /// The attempt is counted and persisted before the handler runs, and only
    /// one retry per entry may be in flight. The handler runs without any DLQ
    /// lock held. Success removes the entry; failure refreshes its error unless
    /// the entry was deleted in the meantime.
    pub fn retry_event(&self, id: FailedEventId) -> Result<(), DlqError> {
        let (event, handler) = self.claim_retry(id)?;
        let _claim = InFlight { dlq: self, id };

        match handler.retry(&event) {
            Ok(()) => {
                // The entry may already be gone if an operator deleted it meanwhile.
                match self.delete_event(id) {
                    Ok(()) | Err(DlqError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
                info!(
                    %id,
                    event_type = %event.event_type,
                    attempts = event.attempts,
                    "failed event retried successfully"
                );
                Ok(())
            }
            Err(err) => {
                let reason = format!("{err:#}");
                warn!(
                    %id,
                    event_type = %event.event_type,
                    attempts = event.attempts,
                    max_attempts = event.max_attempts,
                    error = %reason,
                    "failed event retry failed"
                );

                let mut event = event;
                event.error = reason.clone();
                event.timestamp = Utc::now();
                if !self.update_existing(&event) {
                    debug!(%id, "failed event deleted during retry; not restored");
                }
                Err(DlqError::RetryFailed { id, reason })
            }
        }
    }

    /// Validate, count and persist one attempt, then mark `id` in flight.
    fn claim_retry(
        &self,
        id: FailedEventId,
    ) -> Result<(FailedEvent, Arc<dyn RetryHandler>), DlqError> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);

        let mut event = self.get_event(id)?;

        let handler = self
            .retry_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(DlqError::NoRetryHandler)?;

        if in_flight.contains(&id) {
            return Err(DlqError::RetryInProgress(id));
        }

        if !event.can_retry() {
            return Err(DlqError::MaxAttemptsExceeded {
                id,
                attempts: event.attempts,
                max_attempts: event.max_attempts,
            });
        }

        event.attempts += 1;
        if !self.update_existing(&event) {
            return Err(DlqError::NotFound(id));
        }

        in_flight.insert(id);
        Ok((event, handler))
    }

    pub fn stats(&self) -> DlqStats {
        let total = self.len();
        let mut by_event_type = BTreeMap::new();
        for event in self.list_events(total, 0) {
            *by_event_type.entry(event.event_type).or_insert(0) += 1;
        }

        let utilization_percent = if self.config.max_size == 0 {
            100.0
        } else {
            total as f64 / self.config.max_size as f64 * 100.0
        };

        DlqStats {
            total,
            max_size: self.config.max_size,
            utilization_percent,
            by_event_type,
        }
    }

    /// Entries across storage and memory.
    pub fn len(&self) -> usize {
        let stored = self
            .storage
            .as_deref()
            .map_or(0, |s| self.storage_count(s));
        stored + self.lock_memory().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn new_entry(
        &self,
        event_type: String,
        event_data: Map<String, JsonValue>,
        error: String,
        metadata: HashMap<String, String>,
    ) -> FailedEvent {
        FailedEvent {
            id: FailedEventId::new(),
            event_type,
            event_data,
            error,
            timestamp: Utc::now(),
            attempts: 0,
            max_attempts: self.config.max_attempts,
            topic: None,
            partition: None,
            offset: None,
            metadata,
        }
    }

    fn insert(&self, event: FailedEvent) -> Result<FailedEventId, DlqError> {
        // Held across the capacity check so concurrent inserts cannot overshoot.
        let mut memory = self.lock_memory();

        let stored = self
            .storage
            .as_deref()
            .map_or(0, |s| self.storage_count(s));
        if stored + memory.len() >= self.config.max_size {
            return Err(DlqError::QueueFull {
                max_size: self.config.max_size,
            });
        }

        let id = event.id;
        let event_type = event.event_type.clone();

        match &self.storage {
            Some(storage) => {
                if let Err(e) = storage.store(&event) {
                    warn!(%id, error = %e, "dlq storage write failed; keeping entry in memory");
                    memory.push(event);
                }
            }
            None => memory.push(event),
        }

        debug!(%id, %event_type, "event added to dead letter queue");
        Ok(id)
    }

    /// Write back a modified entry where it currently lives. Entries that no
    /// longer exist are not re-created. Returns whether the entry was found.
    fn update_existing(&self, event: &FailedEvent) -> bool {
        let mut memory = self.lock_memory();
        if let Some(slot) = memory.iter_mut().find(|e| e.id == event.id) {
            *slot = event.clone();
            return true;
        }

        let Some(storage) = &self.storage else {
            return false;
        };
        match storage.get(event.id) {
            Ok(Some(_)) => {
                if let Err(e) = storage.store(event) {
                    warn!(id = %event.id, error = %e, "dlq storage update failed");
                }
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(id = %event.id, error = %e, "dlq storage read failed; update skipped");
                false
            }
        }
    }

    fn storage_count(&self, storage: &dyn DlqStorage) -> usize {
        storage.count().unwrap_or_else(|e| {
            warn!(error = %e, "dlq storage count failed");
            0
        })
    }

    fn lock_memory(&self) -> MutexGuard<'_, Vec<FailedEvent>> {
        self.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases an in-flight retry claim, including when the handler panics.
struct InFlight<'a> {
    dlq: &'a DeadLetterQueue,
    id: FailedEventId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.dlq
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

impl Default for DeadLetterQueue {
    fn default() -> Self {
        Self::new(DlqConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::thread;
    use std::time::Duration;

    fn dlq(max_size: usize, max_attempts: u32) -> DeadLetterQueue {
        DeadLetterQueue::new(
            DlqConfig::default()
                .with_max_size(max_size)
                .with_max_attempts(max_attempts),
        )
    }

    fn data(id: &str) -> Map<String, JsonValue> {
        let mut map = Map::new();
        map.insert("id".into(), JsonValue::String(id.into()));
        map
    }

    fn add(queue: &DeadLetterQueue, event_type: &str) -> FailedEventId {
        queue
            .add_event(event_type, data("x"), "boom", HashMap::new())
            .unwrap()
    }

    #[derive(Default)]
    struct MapStorage {
        entries: Mutex<Vec<FailedEvent>>,
        fail_writes: AtomicBool,
        fail_deletes: AtomicBool,
    }

    impl DlqStorage for MapStorage {
        fn store(&self, event: &FailedEvent) -> Result<(), DlqStorageError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(DlqStorageError::Backend("down".into()));
            }
            let mut entries = self.entries.lock().unwrap();
            match entries.iter_mut().find(|e| e.id == event.id) {
                Some(slot) => *slot = event.clone(),
                None => entries.push(event.clone()),
            }
            Ok(())
        }

        fn get(&self, id: FailedEventId) -> Result<Option<FailedEvent>, DlqStorageError> {
            Ok(self.entries.lock().unwrap().iter().find(|e| e.id == id).cloned())
        }

        fn list(&self, limit: usize, offset: usize) -> Result<Vec<FailedEvent>, DlqStorageError> {
            Ok(self
                .entries
                .lock()
                .unwrap()
                .iter()
                .skip(offset)
                .take(limit)
                .cloned()
                .collect())
        }

        fn delete(&self, id: FailedEventId) -> Result<bool, DlqStorageError> {
            if self.fail_deletes.load(Ordering::SeqCst) {
                return Err(DlqStorageError::Backend("down".into()));
            }
            let mut entries = self.entries.lock().unwrap();
            let before = entries.len();
            entries.retain(|e| e.id != id);
            Ok(entries.len() != before)
        }

        fn count(&self) -> Result<usize, DlqStorageError> {
            Ok(self.entries.lock().unwrap().len())
        }
    }

    #[test]
    fn new_entries_start_with_zero_attempts() {
        let queue = dlq(10, 3);
        let id = queue
            .add_broker_event(
                "user.created",
                data("u-1"),
                "broker down",
                "user-events",
                2,
                17,
                HashMap::new(),
            )
            .unwrap();

        let event = queue.get_event(id).unwrap();
        assert_eq!(event.attempts, 0);
        assert_eq!(event.max_attempts, 3);
        assert_eq!(event.topic.as_deref(), Some("user-events"));
        assert_eq!((event.partition, event.offset), (Some(2), Some(17)));
    }

    #[test]
    fn capacity_is_never_exceeded() {
        let queue = dlq(2, 3);
        add(&queue, "a");
        add(&queue, "b");

        let err = queue
            .add_event("c", Map::new(), "boom", HashMap::new())
            .unwrap_err();

        assert!(matches!(err, DlqError::QueueFull { max_size: 2 }));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn retry_without_handler_is_rejected() {
        let queue = dlq(10, 3);
        let id = add(&queue, "a");

        assert!(matches!(queue.retry_event(id), Err(DlqError::NoRetryHandler)));
        assert!(matches!(
            queue.retry_event(FailedEventId::new()),
            Err(DlqError::NotFound(_))
        ));
    }

    #[test]
    fn failed_retry_counts_attempt_and_keeps_entry() {
        let queue = dlq(10, 3);
        queue.set_retry_handler(Arc::new(|_: &FailedEvent| -> anyhow::Result<()> {
            anyhow::bail!("still down")
        }));
        let id = add(&queue, "a");

        let err = queue.retry_event(id).unwrap_err();

        assert!(matches!(err, DlqError::RetryFailed { .. }));
        let event = queue.get_event(id).unwrap();
        assert_eq!(event.attempts, 1);
        assert_eq!(event.error, "still down");
    }

    #[test]
    fn successful_retry_removes_entry() {
        let queue = dlq(10, 3);
        queue.set_retry_handler(Arc::new(|_: &FailedEvent| -> anyhow::Result<()> { Ok(()) }));
        let id = add(&queue, "a");

        queue.retry_event(id).unwrap();

        assert!(matches!(queue.get_event(id), Err(DlqError::NotFound(_))));
        assert!(queue.is_empty());
    }

    #[test]
    fn retries_stop_at_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let queue = dlq(10, 2);
        queue.set_retry_handler(Arc::new(move |_: &FailedEvent| -> anyhow::Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("nope")
        }));
        let id = add(&queue, "a");

        let _ = queue.retry_event(id);
        let _ = queue.retry_event(id);
        let err = queue.retry_event(id).unwrap_err();

        assert!(matches!(
            err,
            DlqError::MaxAttemptsExceeded { attempts: 2, max_attempts: 2, .. }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn first_installed_retry_handler_wins() {
        let queue = dlq(10, 3);
        let ok = Arc::new(|_: &FailedEvent| -> anyhow::Result<()> { Ok(()) });

        assert!(queue.set_retry_handler_if_absent(ok.clone()));
        assert!(!queue.set_retry_handler_if_absent(ok));
        assert!(queue.has_retry_handler());
    }

    #[test]
    fn stats_group_by_event_type() {
        let queue = dlq(4, 3);
        add(&queue, "user.created");
        add(&queue, "user.created");
        add(&queue, "order.placed");

        let stats = queue.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.utilization_percent, 75.0);
        assert_eq!(stats.by_event_type["user.created"], 2);
        assert_eq!(stats.by_event_type["order.placed"], 1);
    }

    #[test]
    fn lists_storage_entries_before_memory_fallbacks() {
        let storage = Arc::new(MapStorage::default());
        let queue = DeadLetterQueue::with_storage(DlqConfig::default(), storage.clone());

        let stored = add(&queue, "stored");
        storage.fail_writes.store(true, Ordering::SeqCst);
        let fallback = add(&queue, "fallback");

        assert_eq!(storage.count().unwrap(), 1);
        let ids: Vec<_> = queue.list_events(10, 0).into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![stored, fallback]);

        let page: Vec<_> = queue.list_events(1, 1).into_iter().map(|e| e.id).collect();
        assert_eq!(page, vec![fallback]);
        assert_eq!(queue.get_event(fallback).unwrap().event_type, "fallback");
    }

    #[test]
    fn delete_reaches_storage_and_memory() {
        let storage = Arc::new(MapStorage::default());
        let queue = DeadLetterQueue::with_storage(DlqConfig::default(), storage.clone());
        let stored = add(&queue, "stored");

        queue.delete_event(stored).unwrap();

        assert_eq!(storage.count().unwrap(), 0);
        assert!(matches!(queue.delete_event(stored), Err(DlqError::NotFound(_))));
    }

    /// Retry handler that parks inside the call until the test releases it.
    fn gated_handler(succeed: bool) -> (Arc<dyn RetryHandler>, Arc<Barrier>, Arc<Barrier>) {
        let entered = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));
        let (e, r) = (entered.clone(), release.clone());
        let handler: Arc<dyn RetryHandler> = Arc::new(move |_: &FailedEvent| -> anyhow::Result<()> {
            e.wait();
            r.wait();
            if succeed {
                Ok(())
            } else {
                anyhow::bail!("still down")
            }
        });
        (handler, entered, release)
    }

    #[test]
    fn concurrent_retries_of_one_entry_run_the_handler_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let queue = Arc::new(dlq(10, 1));
        queue.set_retry_handler(Arc::new(move |_: &FailedEvent| -> anyhow::Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(100));
            anyhow::bail!("still down")
        }));
        let id = add(&queue, "a");
        let start = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                let start = start.clone();
                thread::spawn(move || {
                    start.wait();
                    queue.retry_event(id)
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let failed = results
            .iter()
            .filter(|r| matches!(r, Err(DlqError::RetryFailed { .. })))
            .count();
        assert_eq!(failed, 1);
        assert!(results.iter().all(|r| matches!(
            r,
            Err(DlqError::RetryFailed { .. }
                | DlqError::RetryInProgress(_)
                | DlqError::MaxAttemptsExceeded { .. })
        )));
        assert_eq!(queue.get_event(id).unwrap().attempts, 1);
    }

    #[test]
    fn retry_of_in_flight_entry_is_rejected() {
        let queue = Arc::new(dlq(10, 3));
        let (handler, entered, release) = gated_handler(true);
        queue.set_retry_handler(handler);
        let id = add(&queue, "a");

        let retry = {
            let queue = queue.clone();
            thread::spawn(move || queue.retry_event(id))
        };
        entered.wait();

        assert!(matches!(queue.retry_event(id), Err(DlqError::RetryInProgress(_))));
        assert_eq!(queue.get_event(id).unwrap().attempts, 1);

        release.wait();
        retry.join().unwrap().unwrap();
        assert!(matches!(queue.get_event(id), Err(DlqError::NotFound(_))));
    }

    #[test]
    fn entry_deleted_during_failed_retry_is_not_restored() {
        let storage = Arc::new(MapStorage::default());
        let queue = Arc::new(DeadLetterQueue::with_storage(
            DlqConfig::default(),
            storage.clone(),
        ));
        let (handler, entered, release) = gated_handler(false);
        queue.set_retry_handler(handler);
        let id = add(&queue, "a");

        let retry = {
            let queue = queue.clone();
            thread::spawn(move || queue.retry_event(id))
        };
        entered.wait();
        queue.delete_event(id).unwrap();
        release.wait();

        assert!(matches!(retry.join().unwrap(), Err(DlqError::RetryFailed { .. })));
        assert!(matches!(queue.get_event(id), Err(DlqError::NotFound(_))));
        assert_eq!(storage.count().unwrap(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn delete_reaches_memory_while_storage_is_down() {
        let storage = Arc::new(MapStorage::default());
        let queue = DeadLetterQueue::with_storage(DlqConfig::default(), storage.clone());
        storage.fail_writes.store(true, Ordering::SeqCst);
        let fallback = add(&queue, "fallback");
        storage.fail_deletes.store(true, Ordering::SeqCst);

        queue.delete_event(fallback).unwrap();

        assert!(matches!(queue.get_event(fallback), Err(DlqError::NotFound(_))));
        assert!(matches!(
            queue.delete_event(FailedEventId::new()),
            Err(DlqError::Storage(_))
        ));
    }
}
