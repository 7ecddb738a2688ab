//! # Restep: durable workflow engine over a pluggable job queue
//!
//! Restep lets you declare named workflows as async functions that survive
//! worker restarts, delays, and retries. A workflow interacts with a
//! [`WorkflowContext`] exposing durable step primitives; on every re-entry
//! of a job, previously completed steps return their recorded result
//! without re-execution, and only the next undone step performs work.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use restep::queue::in_memory::InMemoryQueue;
//! use restep::{Client, ClientOptions, Workflow, WorkflowContext, WorkflowRegistry};
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[derive(Serialize, Deserialize)]
//! struct Order { customer: String }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // 1. Declare a workflow: the input type doubles as the payload schema.
//! let process_order = Workflow::typed::<Order, String, _, _>(
//!     "process-order",
//!     |ctx: WorkflowContext, order: Order| async move {
//!         // Execute-once side effect: replayed from the job record on re-entry.
//!         let charged = ctx
//!             .run("charge", || async { Ok(serde_json::json!({ "ok": true })) })
//!             .await?;
//!
//!         // Durable delay: the job leaves the worker and comes back later.
//!         ctx.sleep("settle", Duration::from_secs(60)).await?;
//!
//!         Ok(format!("charged={} for {}", charged.result, order.customer))
//!     },
//! );
//!
//! // 2. Register workflows and start workers on a queue adapter.
//! let registry = WorkflowRegistry::builder().register(process_order).build();
//! let queue = Arc::new(InMemoryQueue::new());
//! let client = Arc::new(Client::new(queue, registry, ClientOptions::default()));
//! client.start().await?;
//!
//! // 3. Enqueue a job.
//! let wf = client.get_workflow("process-order").unwrap();
//! let created = wf
//!     .create_job(serde_json::json!({ "customer": "c-1" }), None)
//!     .await?;
//! println!("enqueued {}", created.job_id);
//! # Ok(())
//! # }
//! ```
//!
//! ## Key Concepts
//!
//! - **Workflow**: a named durable function with a validated input schema.
//! - **Job**: one invocation of a workflow, identified by a queue-assigned id.
//! - **Step**: a named durable operation within a job (`run`, `sleep`,
//!   `sleep_until`, `repeat`, `invoke`). Step ids must be unique per job and
//!   stable across re-entries.
//! - **Suspension**: steps that wait (sleep, invoke, paced repeat) move the
//!   job onto the queue's delayed set and return [`FlowError::Suspended`],
//!   which must propagate out of the workflow function untouched (use `?`).
//! - **Replay**: the per-job [`state::JobState`] record persists each step's
//!   status and result inside the job's data slot; completed steps are
//!   replayed from it.
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                        Application                           |
//! |   Client ── create_job() / start() / pause() / stop()        |
//! +------------------------------┬-------------------------------+
//!                                v
//! +--------------------------------------------------------------+
//! |                        Engine core                           |
//! |  JobExecutor ── one dispatch: load JobState, run user fn,    |
//! |                 promote waiting callers, persist on exit     |
//! |  StepEngine  ── run / sleep / sleep_until / repeat / invoke  |
//! |  WorkflowContext ── user-facing facade + buffered job logs   |
//! +------------------------------┬-------------------------------+
//!                                v
//! +--------------------------------------------------------------+
//! |                 Queue adapter (trait contract)               |
//! |  enqueue / job / delayed_jobs / spawn_worker                 |
//! |  per-job: update_data, move_to_delayed, promote, phase       |
//! |  sentinels: Suspended (keep delayed), Unrecoverable          |
//! +--------------------------------------------------------------+
//! ```
//!
//! The queue adapter is the sole external dependency of the core. The crate
//! ships an in-memory adapter ([`queue::in_memory::InMemoryQueue`]) that
//! implements the full contract; production deployments back the same
//! traits with a Redis-based queue.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod client;
pub mod context;
pub mod executor;
pub mod logging;
pub mod queue;
pub mod state;
pub mod step;
pub mod workflow;

pub use client::{Client, ClientError, ClientOptions};
pub use context::WorkflowContext;
pub use queue::{
    Deduplication, EnqueueOptions, HandlerError, Job, JobHandler, JobPhase, Queue, QueueError,
    RateLimit, WorkerHandle, WorkerOptions,
};
pub use state::{
    InvocationSubscription, JobErrorRecord, JobMetrics, JobState, PendingInvocation, RepeatCursor,
    SourceSchema, StateError, StepKind, StepState, StepStatus,
};
pub use step::{RepeatOptions, StepOutcome};
pub use workflow::{
    CreatedJob, JobOptions, JobOrder, Workflow, WorkflowHandler, WorkflowRegistry,
    WorkflowRegistryBuilder,
};

/// Log severity for durable, job-persisted log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One durable log line, buffered by the context during a dispatch and
/// drained into `JobState.logs` when the dispatch finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp_ms: u64,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Result sum crossing the workflow-function boundary.
///
/// The two control sentinels ([`FlowError::Suspended`] and
/// [`FlowError::Unrecoverable`]) must pass through user code unchanged:
/// propagate step results with `?` and the engine interprets them at the
/// queue boundary. Everything else is an ordinary failure.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowError {
    /// Control sentinel: the dispatch is not a failure; the job stays in the
    /// delayed set (the step moved it there before returning this).
    Suspended,

    /// Terminal failure that skips the queue's retry policy.
    Unrecoverable(String),

    /// A step's user function failed. Recorded in the step and the job's
    /// error list, then rethrown so the queue's retry policy applies.
    StepFailed { step_id: String, message: String },

    /// `invoke` targeted a workflow id not registered in this client.
    UnknownWorkflow { workflow_id: String },

    /// The job awaited by an `invoke` step reached the failed state.
    InvokedJobFailed { step_id: String, job_id: String },

    /// The context was used before the step engine was bound.
    NotReady,

    /// Job-state preparation or persistence failed.
    State(StateError),

    /// The queue adapter failed.
    Queue(QueueError),
}

impl FlowError {
    /// True for the two reserved control sentinels.
    pub fn is_sentinel(&self) -> bool {
        matches!(self, FlowError::Suspended | FlowError::Unrecoverable(_))
    }
}

impl std::fmt::Display for FlowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowError::Suspended => write!(f, "suspended"),
            FlowError::Unrecoverable(msg) => write!(f, "unrecoverable: {msg}"),
            FlowError::StepFailed { step_id, message } => {
                write!(f, "step {step_id} failed: {message}")
            }
            FlowError::UnknownWorkflow { workflow_id } => {
                write!(f, "unknown workflow: {workflow_id}")
            }
            FlowError::InvokedJobFailed { step_id, job_id } => {
                write!(f, "step {step_id}: invoked job {job_id} failed")
            }
            FlowError::NotReady => write!(f, "context used before the step engine was bound"),
            FlowError::State(e) => write!(f, "{e}"),
            FlowError::Queue(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for FlowError {}

impl From<StateError> for FlowError {
    fn from(e: StateError) -> Self {
        FlowError::State(e)
    }
}

impl From<QueueError> for FlowError {
    fn from(e: QueueError) -> Self {
        FlowError::Queue(e)
    }
}

// Internal codec for typed step results and payloads. Validation happens at
// the serde boundary so user code never handles raw `Value`s unless it asks.
pub(crate) mod codec {
    use serde::{de::DeserializeOwned, Serialize};
    use serde_json::Value;

    pub fn encode<T: Serialize>(v: &T) -> Result<Value, String> {
        serde_json::to_value(v).map_err(|e| e.to_string())
    }

    pub fn decode<T: DeserializeOwned>(v: Value) -> Result<T, String> {
        serde_json::from_value(v).map_err(|e| e.to_string())
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// JSON truthiness: `null`, `false`, `0`, and `""` are falsy, everything
/// else (including empty arrays and objects) is truthy.
pub(crate) fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
