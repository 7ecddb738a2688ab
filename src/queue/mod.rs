//! Queue adapter contract: the sole external dependency of the engine core.
//!
//! # Overview
//!
//! The engine never talks to a broker directly. It drives the [`Queue`] and
//! [`Job`] traits, which a production deployment backs with a Redis-based
//! queue and which [`in_memory::InMemoryQueue`] implements for tests and
//! embedded use. An adapter is responsible for:
//!
//! 1. **Storage**: one mutable data slot per job (the engine persists the
//!    full job-state record into it).
//! 2. **Scheduling**: a waiting set ordered by priority and FIFO/LIFO
//!    insertion, plus a delayed set with due-time promotion.
//! 3. **Delivery**: worker loops that hand `(job, token)` pairs to a
//!    [`JobHandler`] under a concurrency cap, with at-least-once semantics.
//! 4. **Retry policy**: failed dispatches are retried up to the job's
//!    configured retry budget; the reserved sentinels below bypass it.
//!
//! # Reserved sentinels
//!
//! A handler finishes each dispatch with `Result<Value, HandlerError>`:
//!
//! - `Ok(value)`: the job completed; `value` becomes its return value.
//! - `Err(HandlerError::Suspended)`: NOT a failure. The handler already
//!   moved the job onto the delayed set ([`Job::move_to_delayed`]); the
//!   adapter must leave it there and touch nothing else.
//! - `Err(HandlerError::Unrecoverable)`: terminal; skip the retry policy.
//! - `Err(HandlerError::Failed)`: ordinary failure; apply retry/backoff.
//!
//! # Delayed set and promotion
//!
//! `move_to_delayed(until_ms, token)` parks an active job until `until_ms`
//! (the token proves the caller owns the current dispatch). The adapter
//! re-delivers the job after the due time. [`Job::promote`] removes a job
//! from the delayed set early so it is re-delivered immediately; the engine
//! uses it to short-circuit invocation waits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

pub mod in_memory;

/// Adapter error with retry classification, mirrored by every queue method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueError {
    /// Operation that failed (e.g. "enqueue", "move_to_delayed").
    pub operation: String,
    /// Human-readable message.
    pub message: String,
    /// Whether the caller may retry the operation.
    pub retryable: bool,
}

impl QueueError {
    /// A transient error that might succeed on retry.
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// A permanent error that will not succeed on retry.
    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for QueueError {}

/// External lifecycle phase of a job as seen by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPhase {
    Waiting,
    Active,
    Delayed,
    Completed,
    Failed,
}

/// How a dispatch ended, as reported by a [`JobHandler`].
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerError {
    /// Keep-delayed sentinel: the job was already moved to the delayed set.
    Suspended,
    /// Terminal failure that skips the retry policy.
    Unrecoverable(String),
    /// Ordinary failure; the adapter applies its retry/backoff policy.
    Failed(String),
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerError::Suspended => write!(f, "suspended"),
            HandlerError::Unrecoverable(msg) => write!(f, "unrecoverable: {msg}"),
            HandlerError::Failed(msg) => write!(f, "failed: {msg}"),
        }
    }
}

impl std::error::Error for HandlerError {}

impl From<crate::FlowError> for HandlerError {
    fn from(e: crate::FlowError) -> Self {
        match e {
            crate::FlowError::Suspended => HandlerError::Suspended,
            crate::FlowError::Unrecoverable(msg) => HandlerError::Unrecoverable(msg),
            // An unregistered target never resolves on retry; retrying
            // would re-run the whole workflow body for nothing.
            e @ crate::FlowError::UnknownWorkflow { .. } => {
                HandlerError::Unrecoverable(e.to_string())
            }
            other => HandlerError::Failed(other.to_string()),
        }
    }
}

/// Deduplication window: while a job enqueued with the same `id` exists and
/// the window has not elapsed, new enqueues return the existing job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deduplication {
    pub ttl: Duration,
    pub id: String,
}

/// Adapter-level enqueue record, computed by the engine from the merged
/// job options.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Initial delay before the job becomes available.
    pub delay: Option<Duration>,
    /// Scheduling priority; lower values are delivered first.
    pub priority: i64,
    /// LIFO insertion into the waiting set (FIFO when false).
    pub lifo: bool,
    /// Additional delivery attempts after a failed dispatch.
    pub retries: u32,
    /// Deduplication window, if any.
    pub deduplication: Option<Deduplication>,
    /// Caller-chosen job id; enqueueing an existing id returns that job.
    pub job_id: Option<String>,
}

/// Rate limit applied to a worker: at most `max` dispatches per `duration`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimit {
    pub max: u32,
    pub duration: Duration,
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Number of dispatches processed in parallel by this worker.
    pub concurrency: usize,
    /// Optional dispatch rate limit.
    pub limiter: Option<RateLimit>,
    /// Start processing immediately; when false the worker is created
    /// paused and woken by [`WorkerHandle::resume`].
    pub autorun: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            limiter: None,
            autorun: false,
        }
    }
}

/// Control handle for one spawned worker loop.
pub struct WorkerHandle {
    paused: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    pub fn new(autorun: bool) -> Self {
        Self {
            paused: Arc::new(AtomicBool::new(!autorun)),
            stopped: Arc::new(AtomicBool::new(false)),
            join: Mutex::new(None),
        }
    }

    /// Flag shared with the worker loop; true while the worker must not
    /// pick up new jobs.
    pub fn paused_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.paused)
    }

    /// Flag shared with the worker loop; true once the worker must exit.
    pub fn stopped_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stopped)
    }

    /// Attach the spawned loop's join handle so `stop` can abort it.
    pub fn attach(&self, join: JoinHandle<()>) {
        *self.join.lock().expect("worker handle mutex poisoned") = Some(join);
    }

    /// Begin (or continue) picking up jobs.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Stop picking up new jobs; in-flight dispatches finish.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Terminate the worker loop. In-flight dispatches are abandoned to the
    /// queue's at-least-once re-delivery.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(join) = self
            .join
            .lock()
            .expect("worker handle mutex poisoned")
            .take()
        {
            join.abort();
        }
    }
}

/// One enqueued job as seen by the engine.
#[async_trait]
pub trait Job: Send + Sync {
    /// Queue-assigned (or caller-chosen) job id.
    fn id(&self) -> &str;

    /// Name of the queue the job belongs to.
    fn queue_name(&self) -> &str;

    /// Read the job's mutable data slot.
    async fn data(&self) -> Result<Value, QueueError>;

    /// Replace the job's mutable data slot.
    async fn update_data(&self, data: Value) -> Result<(), QueueError>;

    /// Park the active job in the delayed set until `until_ms` (epoch ms).
    /// `token` must match the current dispatch's token.
    async fn move_to_delayed(&self, until_ms: u64, token: &str) -> Result<(), QueueError>;

    /// Change the job's scheduling priority for subsequent deliveries.
    async fn change_priority(&self, priority: i64) -> Result<(), QueueError>;

    /// Remove the job from the delayed set so it is re-delivered now.
    async fn promote(&self) -> Result<(), QueueError>;

    /// Current external phase.
    async fn phase(&self) -> Result<JobPhase, QueueError>;

    /// Return value of a completed job.
    async fn return_value(&self) -> Result<Option<Value>, QueueError>;

    /// Number of times the job has been delivered to a handler.
    async fn attempts_made(&self) -> Result<u32, QueueError>;
}

/// Processes one dispatch of a job. Implemented by the engine's worker glue.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn process(&self, job: Arc<dyn Job>, token: &str) -> Result<Value, HandlerError>;
}

/// The queue adapter.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Adapter name for logging and diagnostics.
    fn name(&self) -> &str {
        "unknown"
    }

    /// Create a job on `queue` with the given data slot contents. Returns
    /// the job id (an existing id when deduplication or a fixed job id
    /// short-circuits the enqueue).
    async fn enqueue(
        &self,
        queue: &str,
        data: Value,
        opts: &EnqueueOptions,
    ) -> Result<String, QueueError>;

    /// Look up a job by id.
    async fn job(&self, queue: &str, id: &str) -> Result<Option<Arc<dyn Job>>, QueueError>;

    /// All jobs currently in the delayed set of `queue`.
    async fn delayed_jobs(&self, queue: &str) -> Result<Vec<Arc<dyn Job>>, QueueError>;

    /// Spawn a worker loop delivering jobs from `queue` to `handler`.
    async fn spawn_worker(
        &self,
        queue: &str,
        handler: Arc<dyn JobHandler>,
        opts: WorkerOptions,
    ) -> Result<WorkerHandle, QueueError>;
}
