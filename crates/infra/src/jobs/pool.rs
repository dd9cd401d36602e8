//! Fixed-size worker pool with bounded queue, in-place retries, and
//! synchronous fallback under backpressure.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use courier_core::{Context, ContextError};

use super::metrics::{MetricsRecorder, PoolMetrics};
use super::types::{Job, RetryPolicy};

/// How long an idle worker waits on the queue before re-checking the stop flag.
const DEQUEUE_TICK: Duration = Duration::from_millis(50);

/// Which thread executed a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerId {
    /// A pool worker thread.
    Worker(usize),
    /// The submitting thread (queue was full).
    Caller,
}

impl core::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            WorkerId::Worker(id) => write!(f, "worker-{id}"),
            WorkerId::Caller => f.write_str("caller"),
        }
    }
}

/// Executes jobs of one kind.
///
/// `handle` is called once per attempt. When the final attempt fails (or the
/// error is not retryable) `on_error` is called exactly once for that job;
/// it is the job's terminal sink (typically the dead-letter queue).
///
/// A panic in `handle` is caught, never retried, and reported once through
/// `on_panic` in place of `on_error`.
pub trait JobHandler<J: Job>: Send + Sync + 'static {
    type Error: std::error::Error + Send + 'static;

    fn handle(&self, worker: WorkerId, job: &J) -> Result<(), Self::Error>;

    fn on_error(&self, worker: WorkerId, job: &J, error: &Self::Error);

    /// Whether a failed attempt may be retried. Defaults to always.
    fn is_retryable(&self, _error: &Self::Error) -> bool {
        true
    }

    /// Terminal sink for a job whose handler panicked. The pool has already
    /// logged the panic; the default does nothing further.
    fn on_panic(&self, _worker: WorkerId, _job: &J, _message: &str) {}
}

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Name for logging and thread names
    pub name: String,
    /// Number of worker threads (0 = every job runs on the caller once the queue is full)
    pub workers: usize,
    /// Bounded queue capacity
    pub queue_capacity: usize,
    /// Backoff applied between attempts
    pub retry: RetryPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "worker-pool".to_string(),
            workers: 4,
            queue_capacity: 1000,
            retry: RetryPolicy::default(),
        }
    }
}

impl PoolConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Outcome of an accepted submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    /// Handed to the queue; a worker will pick it up.
    Queued,
    /// Queue was full; the job already ran to success on the caller's thread.
    Inline,
}

#[derive(Debug, Error)]
pub enum SubmitError<E: std::error::Error> {
    /// The caller's context was done before the job was accepted.
    #[error("submission abandoned: {0}")]
    Context(#[from] ContextError),

    #[error("worker pool is stopped")]
    Stopped,

    /// The queue was full and the inline execution failed terminally.
    /// The handler's error callback has already run.
    #[error("inline execution failed: {0}")]
    Inline(E),

    /// The queue was full and the handler panicked during inline execution.
    /// The handler's panic callback has already run.
    #[error("inline execution panicked: {message}")]
    Panicked { message: String },
}

/// Why a job stopped without succeeding.
enum Failure<E> {
    Error(E),
    Panic(String),
}

impl<E: std::error::Error> From<Failure<E>> for SubmitError<E> {
    fn from(failure: Failure<E>) -> Self {
        match failure {
            Failure::Error(err) => SubmitError::Inline(err),
            Failure::Panic(message) => SubmitError::Panicked { message },
        }
    }
}

#[derive(Debug, Error)]
#[error("failed to spawn worker thread for pool '{pool}': {source}")]
pub struct SpawnError {
    pool: String,
    #[source]
    source: std::io::Error,
}

/// State shared by worker threads and the submitting side.
struct PoolCore<H> {
    name: String,
    handler: H,
    retry: RetryPolicy,
    metrics: MetricsRecorder,
    stop: AtomicBool,
    queued: AtomicUsize,
}

/// A fixed set of worker threads draining a bounded FIFO queue.
///
/// - `submit` never blocks on capacity: a full queue degrades to running the
///   job on the caller's thread
/// - failed attempts are retried in place, sleeping the executing thread
/// - no ordering guarantee across jobs
pub struct WorkerPool<J, H>
where
    J: Job,
    H: JobHandler<J>,
{
    core: Arc<PoolCore<H>>,
    sender: SyncSender<J>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    worker_count: usize,
}

impl<J, H> WorkerPool<J, H>
where
    J: Job,
    H: JobHandler<J>,
{
    /// Spawn the worker threads.
    pub fn start(config: PoolConfig, handler: H) -> Result<Self, SpawnError> {
        let (sender, receiver) = mpsc::sync_channel::<J>(config.queue_capacity);
        let receiver = Arc::new(Mutex::new(receiver));

        let core = Arc::new(PoolCore {
            name: config.name.clone(),
            handler,
            retry: config.retry.clone(),
            metrics: MetricsRecorder::new(config.workers),
            stop: AtomicBool::new(false),
            queued: AtomicUsize::new(0),
        });

        let pool = Self {
            core: core.clone(),
            sender,
            workers: Mutex::new(Vec::with_capacity(config.workers)),
            worker_count: config.workers,
        };

        for id in 0..config.workers {
            let core = core.clone();
            let receiver = receiver.clone();
            let join = thread::Builder::new()
                .name(format!("{}-{}", config.name, id))
                .spawn(move || worker_loop(id, core, receiver))
                .map_err(|source| SpawnError {
                    pool: config.name.clone(),
                    source,
                })?;
            pool.workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(join);
        }

        info!(
            pool = %config.name,
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            max_retries = config.retry.max_retries,
            "worker pool started"
        );

        Ok(pool)
    }

    /// Enqueue a job without blocking.
    ///
    /// Outcomes, in order of precedence:
    /// 1. `ctx` already done: `SubmitError::Context`, the job is not run
    /// 2. pool stopped: `SubmitError::Stopped`
    /// 3. queue has room: `Submitted::Queued`
    /// 4. queue full: the job runs on this thread, with retries, before returning;
    ///    a terminal failure is `SubmitError::Inline` or `SubmitError::Panicked`
    pub fn submit(&self, ctx: &Context, job: J) -> Result<Submitted, SubmitError<H::Error>> {
        if let Some(err) = ctx.err() {
            return Err(SubmitError::Context(err));
        }
        if self.core.stop.load(Ordering::SeqCst) {
            return Err(SubmitError::Stopped);
        }

        // Count before sending so a fast worker never decrements first.
        self.core.queued.fetch_add(1, Ordering::SeqCst);

        match self.sender.try_send(job) {
            Ok(()) => Ok(Submitted::Queued),
            Err(TrySendError::Full(job)) => {
                self.core.queued.fetch_sub(1, Ordering::SeqCst);
                self.core.metrics.record_inline();
                warn!(
                    pool = %self.core.name,
                    job_id = %job.id(),
                    "queue full; executing job on caller thread"
                );
                run_job(&self.core, WorkerId::Caller, job)
                    .map(|()| Submitted::Inline)
                    .map_err(SubmitError::from)
            }
            Err(TrySendError::Disconnected(_)) => {
                self.core.queued.fetch_sub(1, Ordering::SeqCst);
                Err(SubmitError::Stopped)
            }
        }
    }

    /// Signal every worker to stop and wait for all of them to return.
    ///
    /// Workers finish the job they are executing (including its backoff
    /// sleeps); jobs still queued are not drained. Idempotent.
    pub fn stop(&self) {
        let already = self.core.stop.swap(true, Ordering::SeqCst);

        let handles = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            if handle.join().is_err() {
                error!(pool = %self.core.name, "worker thread panicked");
            }
        }

        if !already {
            info!(
                pool = %self.core.name,
                abandoned = self.queue_len(),
                "worker pool stopped"
            );
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.core.stop.load(Ordering::SeqCst)
    }

    /// Snapshot of pool metrics.
    pub fn metrics(&self) -> PoolMetrics {
        self.core.metrics.snapshot()
    }

    /// Jobs waiting in the queue (approximate under concurrency).
    pub fn queue_len(&self) -> usize {
        self.core.queued.load(Ordering::SeqCst)
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn handler(&self) -> &H {
        &self.core.handler
    }
}

impl<J, H> Drop for WorkerPool<J, H>
where
    J: Job,
    H: JobHandler<J>,
{
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop<J, H>(id: usize, core: Arc<PoolCore<H>>, receiver: Arc<Mutex<Receiver<J>>>)
where
    J: Job,
    H: JobHandler<J>,
{
    let worker = WorkerId::Worker(id);
    debug!(pool = %core.name, %worker, "worker started");

    loop {
        if core.stop.load(Ordering::SeqCst) {
            break;
        }

        let next = {
            let rx = receiver.lock().unwrap_or_else(PoisonError::into_inner);
            rx.recv_timeout(DEQUEUE_TICK)
        };

        match next {
            Ok(job) => {
                core.queued.fetch_sub(1, Ordering::SeqCst);
                // Terminal failures were already routed to the error or panic callback.
                let _ = run_job(&core, worker, job);
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!(pool = %core.name, %worker, "worker stopped");
}

/// Run a job to success or terminal failure, retrying in place.
fn run_job<J, H>(core: &PoolCore<H>, worker: WorkerId, mut job: J) -> Result<(), Failure<H::Error>>
where
    J: Job,
    H: JobHandler<J>,
{
    loop {
        let attempt = panic::catch_unwind(AssertUnwindSafe(|| core.handler.handle(worker, &job)));
        let outcome = match attempt {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(
                    pool = %core.name,
                    %worker,
                    job_id = %job.id(),
                    attempt = job.retry_count(),
                    panic = %message,
                    "job handler panicked"
                );
                core.handler.on_panic(worker, &job, &message);
                core.metrics.record_failure(worker);
                return Err(Failure::Panic(message));
            }
        };

        match outcome {
            Ok(()) => {
                core.metrics.record_success(worker);
                debug!(
                    pool = %core.name,
                    %worker,
                    job_id = %job.id(),
                    attempt = job.retry_count(),
                    "job completed"
                );
                return Ok(());
            }
            Err(err) => {
                if !core.handler.is_retryable(&err) || job.is_exhausted() {
                    warn!(
                        pool = %core.name,
                        %worker,
                        job_id = %job.id(),
                        attempts = job.retry_count(),
                        error = %err,
                        "job failed permanently"
                    );
                    core.handler.on_error(worker, &job, &err);
                    core.metrics.record_failure(worker);
                    return Err(Failure::Error(err));
                }

                let delay = core.retry.delay_for_attempt(job.retry_count());
                debug!(
                    pool = %core.name,
                    %worker,
                    job_id = %job.id(),
                    attempt = job.retry_count(),
                    max_retries = job.max_retries(),
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "job attempt failed; retrying"
                );
                thread::sleep(delay);
                job.next_attempt();
                core.metrics.record_retry();
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
