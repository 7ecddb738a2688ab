//! User-facing execution context.
//!
//! A [`WorkflowContext`] is handed to the workflow function on every
//! dispatch. It is a thin facade routing the step primitives into the
//! engine and buffering durable log lines; the engine back-pointer is
//! bound lazily by the executor, so a context used outside a dispatch
//! reports [`FlowError::NotReady`].

use crate::step::{RepeatOptions, StepEngine, StepOutcome};
use crate::workflow::Workflow;
use crate::{codec, now_ms, FlowError, LogEntry, LogLevel};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone)]
pub struct WorkflowContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    job_id: String,
    workflow_id: String,
    attempts: u32,
    engine: Mutex<Option<Arc<StepEngine>>>,
    logs: Mutex<Vec<LogEntry>>,
}

impl WorkflowContext {
    pub(crate) fn new(job_id: String, workflow_id: String, attempts: u32) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                job_id,
                workflow_id,
                attempts,
                engine: Mutex::new(None),
                logs: Mutex::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn bind(&self, engine: Arc<StepEngine>) {
        *self.inner.engine.lock().expect("context mutex poisoned") = Some(engine);
    }

    fn engine(&self) -> Result<Arc<StepEngine>, FlowError> {
        self.inner
            .engine
            .lock()
            .expect("context mutex poisoned")
            .clone()
            .ok_or(FlowError::NotReady)
    }

    /// Id of the job this dispatch belongs to.
    pub fn job_id(&self) -> &str {
        &self.inner.job_id
    }

    /// Id of the workflow being executed.
    pub fn workflow_id(&self) -> &str {
        &self.inner.workflow_id
    }

    /// How many times this job has entered a worker, this dispatch included.
    pub fn attempts(&self) -> u32 {
        self.inner.attempts
    }

    /// Execute-once side effect. On re-entry the recorded result is
    /// replayed and `f` is not called.
    pub async fn run<F, Fut>(&self, id: &str, f: F) -> Result<StepOutcome, FlowError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, String>> + Send,
    {
        self.engine()?.run(id, f).await
    }

    /// Typed variant of [`Self::run`]: the closure's output is recorded as
    /// JSON and decoded again on replay.
    pub async fn run_typed<T, F, Fut>(&self, id: &str, f: F) -> Result<T, FlowError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, String>> + Send,
    {
        let outcome = self
            .engine()?
            .run(id, || async move {
                let value = f().await?;
                codec::encode(&value)
            })
            .await?;
        codec::decode(outcome.result).map_err(|e| FlowError::StepFailed {
            step_id: id.to_string(),
            message: format!("decode recorded result: {e}"),
        })
    }

    /// Durable delay. Never returns on the first call: the job is parked in
    /// the delayed set and [`FlowError::Suspended`] propagates out of the
    /// workflow function. The post-delay re-entry returns `true`.
    pub async fn sleep(&self, id: &str, duration: Duration) -> Result<StepOutcome, FlowError> {
        self.engine()?.sleep(id, duration).await
    }

    /// Durable delay until an absolute timestamp (epoch ms).
    pub async fn sleep_until(&self, id: &str, at_ms: u64) -> Result<StepOutcome, FlowError> {
        self.engine()?.sleep_until(id, at_ms).await
    }

    /// Durable bounded-retry polling: runs `f` until truthy or `limit`
    /// exhausted (result `false`). See [`RepeatOptions`].
    pub async fn repeat<F, Fut>(
        &self,
        id: &str,
        opts: RepeatOptions,
        f: F,
    ) -> Result<StepOutcome, FlowError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Value, String>> + Send,
    {
        self.engine()?.repeat(id, opts, f).await
    }

    /// Invoke another workflow registered in the same client and await its
    /// result. Suspends until the invoked job completes or fails.
    pub async fn invoke(
        &self,
        id: &str,
        workflow_id: &str,
        data: Value,
    ) -> Result<StepOutcome, FlowError> {
        self.engine()?.invoke(id, workflow_id, data).await
    }

    /// [`Self::invoke`] bound to a workflow object instead of an id.
    pub async fn invoke_workflow(
        &self,
        workflow: &Workflow,
        id: &str,
        data: Value,
    ) -> Result<StepOutcome, FlowError> {
        self.invoke(id, workflow.id(), data).await
    }

    /// Typed variant of [`Self::invoke`]: decodes the invoked job's return
    /// value.
    pub async fn invoke_typed<T>(
        &self,
        id: &str,
        workflow_id: &str,
        data: Value,
    ) -> Result<T, FlowError>
    where
        T: DeserializeOwned,
    {
        let outcome = self.invoke(id, workflow_id, data).await?;
        codec::decode(outcome.result).map_err(|e| FlowError::StepFailed {
            step_id: id.to_string(),
            message: format!("decode invoked result: {e}"),
        })
    }

    /// Buffer a durable log line. Lines are drained into the job record
    /// when the dispatch finishes (including on suspension).
    pub fn log(&self, level: LogLevel, message: impl Into<String>, metadata: Option<Value>) {
        self.inner
            .logs
            .lock()
            .expect("context mutex poisoned")
            .push(LogEntry {
                timestamp_ms: now_ms(),
                level,
                message: message.into(),
                metadata,
            });
    }

    pub(crate) fn drain_logs(&self) -> Vec<LogEntry> {
        std::mem::take(&mut *self.inner.logs.lock().expect("context mutex poisoned"))
    }
}
