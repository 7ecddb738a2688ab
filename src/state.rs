//! Persistent per-job state.
//!
//! [`JobState`] is the record that survives across re-entries of a job: the
//! validated source payload, the per-step state map, invocation-wait
//! subscriptions, durable logs, metrics, and errors. It lives inside the
//! job's mutable data slot and is rewritten in full on every persistence
//! point. [`StateCell`] is the in-memory handle one dispatch owns;
//! [`StepHandle`] is the per-step view the step primitives drive.

use crate::queue::Job;
use crate::{now_ms, FlowError, LogEntry};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Errors raised while preparing or persisting a job's state record.
#[derive(Debug, Clone, PartialEq)]
pub enum StateError {
    /// The source payload did not satisfy the workflow's input schema.
    SchemaMismatch { workflow_id: String, message: String },

    /// A `source` with its own truthy `prepared` field was about to be
    /// persisted. Nesting one engine record inside another is always a bug.
    InvalidSource,

    /// A step handle's record is gone from the state map.
    MissingStep { step_id: String },

    /// The record could not be (de)serialized.
    Serialization(String),
}

impl std::fmt::Display for StateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateError::SchemaMismatch {
                workflow_id,
                message,
            } => write!(f, "payload rejected by schema of {workflow_id}: {message}"),
            StateError::InvalidSource => {
                write!(f, "refusing to persist a source that is itself prepared")
            }
            StateError::MissingStep { step_id } => {
                write!(f, "no step record for {step_id}")
            }
            StateError::Serialization(msg) => write!(f, "job state serialization: {msg}"),
        }
    }
}

impl std::error::Error for StateError {}

/// Validates a workflow's input payload and returns the normalized value
/// that becomes `JobState.source`.
pub trait SourceSchema: Send + Sync {
    fn validate(&self, value: Value) -> Result<Value, String>;
}

/// Step kind, set at first creation of a step and immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepKind {
    #[serde(rename = "run")]
    Run,
    #[serde(rename = "sleep")]
    Sleep,
    #[serde(rename = "sleep-until")]
    SleepUntil,
    #[serde(rename = "repeat")]
    Repeat,
    #[serde(rename = "invoke-wait-for-result")]
    Invoke,
}

/// Step status machine.
///
/// ```text
/// absent ──start──> active ──complete──> completed (terminal)
///                     │  \──fail───────> failed    (terminal)
///                     └──(set delayed)─> delayed ──complete/fail──> terminal
/// ```
///
/// `Delayed → Completed` only ever happens on the resumption branch of a
/// step primitive; a completed step never transitions again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Active,
    Completed,
    Failed,
    Delayed,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed)
    }
}

/// Timing for one step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
}

/// Persisted record of one step's progress within a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepState {
    #[serde(rename = "type")]
    pub kind: StepKind,
    pub status: StepStatus,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metrics: StepMetrics,
}

impl StepState {
    fn new(kind: StepKind) -> Self {
        Self {
            kind,
            status: StepStatus::Active,
            result: Value::Null,
            error: None,
            metrics: StepMetrics::default(),
        }
    }
}

/// A job waiting on this job's completion: written by the caller's `invoke`
/// step into the invoked job's record, read by the invoked job's executor
/// on clean completion to promote the caller out of the delayed set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationSubscription {
    pub caller_workflow_id: String,
    pub caller_step_id: String,
}

/// Job-level timing and attempt counting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default)]
    pub attempts: u32,
}

/// One recorded step failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobErrorRecord {
    pub step_id: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

/// Protocol record held in an in-flight `invoke` step's result slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingInvocation {
    pub job_id: String,
}

/// Protocol record held in an in-flight `repeat` step's result slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepeatCursor {
    pub attempt: u32,
    #[serde(default)]
    pub last_result: Value,
    pub completed: bool,
    pub needs_delay: bool,
}

/// The engine-managed record persisted in a job's data slot.
///
/// `prepared` marks the record as engine-owned and prevents double-wrapping
/// on re-entry; `source` is the validated user payload, immutable for the
/// life of the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobState {
    pub prepared: bool,
    pub source: Value,
    #[serde(default)]
    pub steps: HashMap<String, StepState>,
    #[serde(default)]
    pub invocations: Vec<InvocationSubscription>,
    #[serde(default)]
    pub metrics: JobMetrics,
    #[serde(default)]
    pub errors: Vec<JobErrorRecord>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
}

impl JobState {
    /// Idempotent envelope: a value that already parses as a prepared record
    /// is returned as-is (`was_prepared = true`); anything else is wrapped
    /// into a fresh record with the raw value as `source`.
    pub fn prepare(raw: Value) -> (bool, JobState) {
        if let Ok(state) = serde_json::from_value::<JobState>(raw.clone()) {
            if state.prepared {
                return (true, state);
            }
        }
        (
            false,
            JobState {
                prepared: true,
                source: raw,
                steps: HashMap::new(),
                invocations: Vec::new(),
                metrics: JobMetrics::default(),
                errors: Vec::new(),
                logs: Vec::new(),
            },
        )
    }
}

/// Shared handle to one dispatch's [`JobState`].
///
/// The cell is cloned into the executor, the step engine, and the context;
/// the lock is never held across an await point.
#[derive(Clone)]
pub struct StateCell {
    inner: Arc<Mutex<JobState>>,
}

impl StateCell {
    pub fn new(state: JobState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    /// Prepare the job's raw data into a [`JobState`]. A freshly wrapped
    /// record has its source validated through the workflow schema and is
    /// persisted back immediately so subsequent readers see a stable shape.
    pub async fn load(
        job: &dyn Job,
        workflow_id: &str,
        schema: &dyn SourceSchema,
    ) -> Result<(bool, StateCell), FlowError> {
        let raw = job.data().await?;
        let (was_prepared, mut state) = JobState::prepare(raw);
        if !was_prepared {
            let validated =
                schema
                    .validate(state.source)
                    .map_err(|message| StateError::SchemaMismatch {
                        workflow_id: workflow_id.to_string(),
                        message,
                    })?;
            state.source = validated;
        }
        let cell = StateCell::new(state);
        if !was_prepared {
            cell.persist(job).await?;
        }
        Ok((was_prepared, cell))
    }

    /// Write the current record back to the job's data slot. Rejects a
    /// `source` whose own `prepared` field is truthy.
    pub async fn persist(&self, job: &dyn Job) -> Result<(), FlowError> {
        let value = {
            let guard = self.lock();
            if guard
                .source
                .get("prepared")
                .map(crate::is_truthy)
                .unwrap_or(false)
            {
                return Err(StateError::InvalidSource.into());
            }
            serde_json::to_value(&*guard).map_err(|e| StateError::Serialization(e.to_string()))?
        };
        job.update_data(value).await?;
        Ok(())
    }

    /// Idempotent step-handle acquisition: adopts a pre-existing step record
    /// for `id` or creates a fresh one with `status = Active`. The kind of an
    /// existing record is kept (step kinds never change).
    pub fn step(&self, id: &str, kind: StepKind) -> StepHandle {
        {
            let mut guard = self.lock();
            guard
                .steps
                .entry(id.to_string())
                .or_insert_with(|| StepState::new(kind));
        }
        StepHandle {
            inner: Arc::clone(&self.inner),
            id: id.to_string(),
        }
    }

    /// Run a closure under the state lock.
    pub fn with<R>(&self, f: impl FnOnce(&mut JobState) -> R) -> R {
        f(&mut self.lock())
    }

    /// Snapshot of the current record.
    pub fn snapshot(&self) -> JobState {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, JobState> {
        // Poisoning means another dispatch thread panicked mid-mutation.
        self.inner.lock().expect("job state mutex poisoned")
    }
}

/// Per-step view over the shared [`JobState`], enforcing the status machine.
#[derive(Clone)]
pub struct StepHandle {
    inner: Arc<Mutex<JobState>>,
    id: String,
}

impl StepHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> Result<StepKind, StateError> {
        self.with_step(|s| s.kind)
    }

    pub fn status(&self) -> Result<StepStatus, StateError> {
        self.with_step(|s| s.status)
    }

    pub fn result(&self) -> Result<Value, StateError> {
        self.with_step(|s| s.result.clone())
    }

    /// Direct result write for the multi-field repeat/invoke protocols.
    pub fn set_result(&self, value: Value) -> Result<(), StateError> {
        self.with_step(|s| s.result = value)
    }

    /// Mark the step active and stamp `started_at` on first start. A failed
    /// step re-arms here when the queue retries the job; completed and
    /// delayed steps are untouched.
    pub fn start(&self) -> Result<(), StateError> {
        self.with_step(|s| {
            if s.status == StepStatus::Failed {
                s.status = StepStatus::Active;
                s.error = None;
            }
            if s.status == StepStatus::Active && s.metrics.started_at.is_none() {
                s.metrics.started_at = Some(now_ms());
            }
        })
    }

    /// Move a step between `Active` and `Delayed`. Completed and failed
    /// steps never transition here (failed steps re-arm via [`Self::start`]).
    pub fn set_status(&self, status: StepStatus) -> Result<(), StateError> {
        self.with_step(|s| {
            if !s.status.is_terminal() && !status.is_terminal() {
                s.status = status;
            }
        })
    }

    /// Complete the step with `result`, stamping `completed_at` and
    /// `duration`. No-op on terminal steps: a completed result is
    /// authoritative on all future re-entries.
    pub fn complete(&self, result: Value) -> Result<(), StateError> {
        self.with_step(|s| {
            if s.status.is_terminal() {
                return;
            }
            let completed_at = now_ms();
            s.status = StepStatus::Completed;
            s.result = result;
            s.metrics.completed_at = Some(completed_at);
            let started = s.metrics.started_at.unwrap_or(completed_at);
            s.metrics.duration = Some(completed_at.saturating_sub(started));
        })
    }

    /// Fail the step, stamping `failed_at` and the error's string form.
    /// No-op on completed steps.
    pub fn fail(&self, error: &str) -> Result<(), StateError> {
        self.with_step(|s| {
            if s.status == StepStatus::Completed {
                return;
            }
            s.status = StepStatus::Failed;
            s.error = Some(error.to_string());
            s.metrics.failed_at = Some(now_ms());
        })
    }

    fn with_step<R>(&self, f: impl FnOnce(&mut StepState) -> R) -> Result<R, StateError> {
        let mut guard = self.inner.lock().expect("job state mutex poisoned");
        let step = guard
            .steps
            .get_mut(&self.id)
            .ok_or_else(|| StateError::MissingStep {
                step_id: self.id.clone(),
            })?;
        Ok(f(step))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prepare_wraps_raw_payloads() {
        let (was_prepared, state) = JobState::prepare(json!({ "number": 21 }));
        assert!(!was_prepared);
        assert!(state.prepared);
        assert_eq!(state.source, json!({ "number": 21 }));
        assert!(state.steps.is_empty());
        assert_eq!(state.metrics.attempts, 0);
    }

    #[test]
    fn prepare_is_idempotent() {
        let (_, first) = JobState::prepare(json!({ "x": 1 }));
        let envelope = serde_json::to_value(&first).unwrap();
        let (was_prepared, second) = JobState::prepare(envelope);
        assert!(was_prepared);
        assert_eq!(first, second);
    }

    #[test]
    fn prepare_keeps_existing_steps() {
        let (_, mut state) = JobState::prepare(json!("payload"));
        state.steps.insert(
            "a".to_string(),
            StepState {
                kind: StepKind::Run,
                status: StepStatus::Completed,
                result: json!(42),
                error: None,
                metrics: StepMetrics::default(),
            },
        );
        let envelope = serde_json::to_value(&state).unwrap();
        let (was_prepared, reloaded) = JobState::prepare(envelope);
        assert!(was_prepared);
        assert_eq!(reloaded.steps["a"].result, json!(42));
        assert_eq!(reloaded.steps["a"].status, StepStatus::Completed);
    }

    #[test]
    fn wire_shape_uses_fixed_keys() {
        let (_, state) = JobState::prepare(json!({ "n": 1 }));
        let value = serde_json::to_value(&state).unwrap();
        let obj = value.as_object().unwrap();
        for key in ["prepared", "source", "steps", "invocations", "metrics", "errors", "logs"] {
            assert!(obj.contains_key(key), "missing key {key}");
        }
    }

    #[test]
    fn step_completion_is_terminal() {
        let cell = StateCell::new(JobState::prepare(json!(null)).1);
        let step = cell.step("s", StepKind::Run);
        step.start().unwrap();
        step.complete(json!("first")).unwrap();
        step.complete(json!("second")).unwrap();
        step.fail("late failure").unwrap();
        assert_eq!(step.status().unwrap(), StepStatus::Completed);
        assert_eq!(step.result().unwrap(), json!("first"));
        assert!(cell.with(|s| s.steps["s"].error.is_none()));
    }

    #[test]
    fn delayed_step_can_complete() {
        let cell = StateCell::new(JobState::prepare(json!(null)).1);
        let step = cell.step("s", StepKind::Sleep);
        step.start().unwrap();
        step.set_status(StepStatus::Delayed).unwrap();
        assert_eq!(step.status().unwrap(), StepStatus::Delayed);
        step.complete(json!(true)).unwrap();
        assert_eq!(step.status().unwrap(), StepStatus::Completed);
        // A terminal step no longer moves back to delayed.
        step.set_status(StepStatus::Delayed).unwrap();
        assert_eq!(step.status().unwrap(), StepStatus::Completed);
    }

    #[test]
    fn failed_step_rearms_on_retry_start() {
        let cell = StateCell::new(JobState::prepare(json!(null)).1);
        let step = cell.step("s", StepKind::Run);
        step.start().unwrap();
        step.fail("boom").unwrap();
        assert_eq!(step.status().unwrap(), StepStatus::Failed);
        // A queue-level retry re-enters the step; start() re-arms it.
        step.start().unwrap();
        assert_eq!(step.status().unwrap(), StepStatus::Active);
        assert!(cell.with(|s| s.steps["s"].error.is_none()));
        step.complete(json!("second try")).unwrap();
        assert_eq!(step.status().unwrap(), StepStatus::Completed);
    }

    #[test]
    fn step_handle_is_idempotent_per_id() {
        let cell = StateCell::new(JobState::prepare(json!(null)).1);
        let first = cell.step("s", StepKind::Repeat);
        first.set_result(json!({ "attempt": 1 })).unwrap();
        // Re-acquiring must adopt the existing record, kind included.
        let second = cell.step("s", StepKind::Run);
        assert_eq!(second.kind().unwrap(), StepKind::Repeat);
        assert_eq!(second.result().unwrap(), json!({ "attempt": 1 }));
    }

    #[test]
    fn handle_reports_a_vanished_step_record() {
        let cell = StateCell::new(JobState::prepare(json!(null)).1);
        let step = cell.step("s", StepKind::Run);
        cell.with(|s| {
            s.steps.remove("s");
        });
        assert_eq!(
            step.status().unwrap_err(),
            StateError::MissingStep {
                step_id: "s".to_string()
            }
        );
    }

    #[tokio::test]
    async fn persist_rejects_a_nested_prepared_source() {
        use crate::queue::in_memory::InMemoryQueue;
        use crate::queue::{EnqueueOptions, Queue};

        let queue = InMemoryQueue::new();
        let id = queue
            .enqueue("q", json!({}), &EnqueueOptions::default())
            .await
            .unwrap();
        let job = queue.job("q", &id).await.unwrap().unwrap();

        let (_, mut state) = JobState::prepare(json!({}));
        state.source = json!({ "prepared": true, "smuggled": 1 });
        let err = StateCell::new(state).persist(&*job).await.unwrap_err();
        assert_eq!(err, FlowError::State(StateError::InvalidSource));
    }

    #[test]
    fn completion_stamps_duration() {
        let cell = StateCell::new(JobState::prepare(json!(null)).1);
        let step = cell.step("s", StepKind::Run);
        step.start().unwrap();
        step.complete(json!(1)).unwrap();
        let metrics = cell.with(|s| s.steps["s"].metrics.clone());
        assert!(metrics.started_at.is_some());
        assert!(metrics.completed_at.is_some());
        assert!(metrics.duration.is_some());
    }
}
