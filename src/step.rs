//! Durable step primitives.
//!
//! `StepEngine` implements the five step operations behind the context
//! facade. Every operation obeys the first-call / resumption dichotomy
//! driven by the persisted [`StepStatus`]: a completed step returns its
//! recorded result without executing user code, and every mutation is
//! persisted to the job's data slot before the job can suspend.
//!
//! Suspension is expressed as data, not unwinding: a step that needs to
//! wait parks the job in the queue's delayed set and returns
//! [`FlowError::Suspended`], which the workflow function propagates with
//! `?` back to the worker loop.

use crate::client::ClientCore;
use crate::queue::{Job, QueueError};
use crate::state::{
    InvocationSubscription, JobErrorRecord, PendingInvocation, RepeatCursor, StateCell, StepKind,
    StepStatus,
};
use crate::{codec, is_truthy, now_ms, FlowError};
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, warn};

/// Result of a step primitive.
///
/// `ran` is false when the step was replayed from the job record; the
/// result is then the recorded value of the original execution.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub ran: bool,
    pub result: Value,
}

impl StepOutcome {
    fn replayed(result: Value) -> Self {
        Self { ran: false, result }
    }

    fn fresh(result: Value) -> Self {
        Self { ran: true, result }
    }

    /// JSON truthiness of the result (`null`, `false`, `0`, `""` are falsy).
    pub fn truthy(&self) -> bool {
        is_truthy(&self.result)
    }
}

/// Bounds for a repeat step.
#[derive(Debug, Clone, Default)]
pub struct RepeatOptions {
    /// Maximum number of attempts before the step completes with `false`.
    pub limit: u32,
    /// Pause between unsuccessful attempts. `None` (or zero) retries in a
    /// tight in-worker loop without returning control to the queue.
    pub every: Option<Duration>,
}

/// Executes step primitives for one dispatch of one job.
pub(crate) struct StepEngine {
    cell: StateCell,
    job: Arc<dyn Job>,
    token: String,
    workflow_id: String,
    core: Weak<ClientCore>,
    delayed_run_priority: i64,
    invoke_poll_interval: Duration,
}

impl StepEngine {
    pub(crate) fn new(
        cell: StateCell,
        job: Arc<dyn Job>,
        token: String,
        workflow_id: String,
        core: Weak<ClientCore>,
        delayed_run_priority: i64,
        invoke_poll_interval: Duration,
    ) -> Self {
        Self {
            cell,
            job,
            token,
            workflow_id,
            core,
            delayed_run_priority,
            invoke_poll_interval,
        }
    }

    /// Execute-once side effect. Runs `f` on the first entry only; replays
    /// the recorded result afterwards. Never suspends.
    pub(crate) async fn run<F, Fut>(&self, id: &str, f: F) -> Result<StepOutcome, FlowError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, String>> + Send,
    {
        let step = self.cell.step(id, StepKind::Run);
        if step.status()? == StepStatus::Completed {
            return Ok(StepOutcome::replayed(step.result()?));
        }
        step.start()?;
        match f().await {
            Ok(result) => {
                step.complete(result.clone())?;
                self.cell.persist(&*self.job).await?;
                Ok(StepOutcome::fresh(result))
            }
            Err(message) => self.fail_step(id, &step, message).await,
        }
    }

    /// Durable delay. First call parks the job in the delayed set and
    /// suspends; the post-delay re-entry completes with `true`.
    pub(crate) async fn sleep(&self, id: &str, duration: Duration) -> Result<StepOutcome, FlowError> {
        self.sleep_inner(id, StepKind::Sleep, duration).await
    }

    /// Durable delay until an absolute timestamp (epoch ms). Timestamps in
    /// the past degenerate to an immediate re-entry.
    pub(crate) async fn sleep_until(&self, id: &str, at_ms: u64) -> Result<StepOutcome, FlowError> {
        let duration = Duration::from_millis(at_ms.saturating_sub(now_ms()));
        self.sleep_inner(id, StepKind::SleepUntil, duration).await
    }

    async fn sleep_inner(
        &self,
        id: &str,
        kind: StepKind,
        duration: Duration,
    ) -> Result<StepOutcome, FlowError> {
        let step = self.cell.step(id, kind);
        match step.status()? {
            StepStatus::Completed => Ok(StepOutcome::replayed(step.result()?)),
            StepStatus::Delayed => {
                // The queue re-delivered the job after the delay elapsed.
                step.complete(Value::Bool(true))?;
                self.cell.persist(&*self.job).await?;
                Ok(StepOutcome::fresh(Value::Bool(true)))
            }
            _ => {
                step.start()?;
                step.set_status(StepStatus::Delayed)?;
                self.cell.persist(&*self.job).await?;
                // Post-delay processing is ordered after fresh arrivals.
                self.job.change_priority(self.delayed_run_priority).await?;
                self.job
                    .move_to_delayed(now_ms() + duration.as_millis() as u64, &self.token)
                    .await?;
                debug!(
                    job_id = %self.job.id(),
                    step_id = %id,
                    delay_ms = duration.as_millis() as u64,
                    "step sleeping"
                );
                Err(FlowError::Suspended)
            }
        }
    }

    /// Durable bounded-retry polling. Runs `f` until it returns a truthy
    /// value or `limit` attempts are exhausted (then completes with
    /// `false`). With `every` set, unsuccessful attempts hand the job back
    /// to the queue for the pause; otherwise attempts loop in-worker.
    pub(crate) async fn repeat<F, Fut>(
        &self,
        id: &str,
        opts: RepeatOptions,
        f: F,
    ) -> Result<StepOutcome, FlowError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Value, String>> + Send,
    {
        let step = self.cell.step(id, StepKind::Repeat);
        if step.status()? == StepStatus::Completed {
            return Ok(StepOutcome::replayed(step.result()?));
        }
        step.start()?;

        let mut cursor = match step.result()? {
            Value::Null => {
                let cursor = RepeatCursor::default();
                step.set_result(codec::encode(&cursor).map_err(crate::StateError::Serialization)?)?;
                self.cell.persist(&*self.job).await?;
                cursor
            }
            value => codec::decode::<RepeatCursor>(value)
                .map_err(crate::StateError::Serialization)?,
        };

        if step.status()? == StepStatus::Delayed && cursor.needs_delay {
            // Resumption from an inter-attempt pause.
            cursor.needs_delay = false;
            step.set_result(codec::encode(&cursor).map_err(crate::StateError::Serialization)?)?;
            step.set_status(StepStatus::Active)?;
            self.cell.persist(&*self.job).await?;
        }

        let every = opts.every.filter(|d| !d.is_zero());
        loop {
            if cursor.attempt >= opts.limit {
                step.complete(Value::Bool(false))?;
                self.cell.persist(&*self.job).await?;
                return Ok(StepOutcome::fresh(Value::Bool(false)));
            }

            let result = match f().await {
                Ok(result) => result,
                Err(message) => return self.fail_step(id, &step, message).await,
            };
            cursor.attempt += 1;
            cursor.last_result = result.clone();

            if is_truthy(&result) {
                cursor.completed = true;
                step.complete(result.clone())?;
                self.cell.persist(&*self.job).await?;
                return Ok(StepOutcome::fresh(result));
            }

            if let Some(pause) = every {
                if cursor.attempt < opts.limit {
                    cursor.needs_delay = true;
                    step.set_result(
                        codec::encode(&cursor).map_err(crate::StateError::Serialization)?,
                    )?;
                    step.set_status(StepStatus::Delayed)?;
                    self.cell.persist(&*self.job).await?;
                    self.job
                        .move_to_delayed(now_ms() + pause.as_millis() as u64, &self.token)
                        .await?;
                    debug!(
                        job_id = %self.job.id(),
                        step_id = %id,
                        attempt = cursor.attempt,
                        "repeat pausing between attempts"
                    );
                    return Err(FlowError::Suspended);
                }
            }

            // No pacing requested: record the attempt and try again without
            // returning control to the queue. The limit check above bounds
            // the loop.
            step.set_result(codec::encode(&cursor).map_err(crate::StateError::Serialization)?)?;
            step.set_status(StepStatus::Active)?;
            self.cell.persist(&*self.job).await?;
        }
    }

    /// Cross-workflow invocation with result awaiting. Enqueues a job in
    /// the target workflow, subscribes to its completion, then suspends
    /// until the invoked job reaches a terminal state. Completion normally
    /// arrives via promotion by the invoked job's executor; a poll delay
    /// backstops missed promotions.
    pub(crate) async fn invoke(
        &self,
        id: &str,
        workflow_id: &str,
        payload: Value,
    ) -> Result<StepOutcome, FlowError> {
        let step = self.cell.step(id, StepKind::Invoke);
        match step.status()? {
            StepStatus::Completed => Ok(StepOutcome::replayed(step.result()?)),
            StepStatus::Delayed => self.invoke_poll(id, workflow_id, &step).await,
            _ => self.invoke_start(id, workflow_id, payload, &step).await,
        }
    }

    async fn invoke_start(
        &self,
        id: &str,
        workflow_id: &str,
        payload: Value,
        step: &crate::state::StepHandle,
    ) -> Result<StepOutcome, FlowError> {
        let core = self.core.upgrade().ok_or(FlowError::NotReady)?;
        if core.workflow(workflow_id).is_none() {
            return Err(FlowError::UnknownWorkflow {
                workflow_id: workflow_id.to_string(),
            });
        }
        step.start()?;

        let created = match core.create_job(workflow_id, payload, None).await {
            Ok(created) => created,
            Err(e) => return self.fail_step(id, step, e.to_string()).await,
        };

        // Subscribe inside the invoked job's freshly-prepared record so its
        // completion can promote us out of the delayed set.
        let target_queue = core.queue_name(workflow_id);
        let invoked = core
            .queue()
            .job(&target_queue, &created.job_id)
            .await?
            .ok_or_else(|| {
                QueueError::permanent(
                    "invoke",
                    format!("enqueued job vanished: {}", created.job_id),
                )
            })?;
        let raw = invoked.data().await?;
        let (_, mut invoked_state) = crate::state::JobState::prepare(raw);
        invoked_state.invocations.push(InvocationSubscription {
            caller_workflow_id: self.workflow_id.clone(),
            caller_step_id: id.to_string(),
        });
        StateCell::new(invoked_state).persist(&*invoked).await?;

        let pending = PendingInvocation {
            job_id: created.job_id.clone(),
        };
        step.set_result(codec::encode(&pending).map_err(crate::StateError::Serialization)?)?;
        step.set_status(StepStatus::Delayed)?;
        self.cell.persist(&*self.job).await?;
        debug!(
            job_id = %self.job.id(),
            step_id = %id,
            target_workflow = %workflow_id,
            invoked_job = %created.job_id,
            "invoke waiting for result"
        );
        self.delay_self().await?;
        Err(FlowError::Suspended)
    }

    async fn invoke_poll(
        &self,
        id: &str,
        workflow_id: &str,
        step: &crate::state::StepHandle,
    ) -> Result<StepOutcome, FlowError> {
        let pending: PendingInvocation =
            codec::decode(step.result()?).map_err(crate::StateError::Serialization)?;
        let core = self.core.upgrade().ok_or(FlowError::NotReady)?;
        let target_queue = core.queue_name(workflow_id);
        let Some(invoked) = core.queue().job(&target_queue, &pending.job_id).await? else {
            // Retention removed the invoked job; waiting forever would leak
            // the caller.
            warn!(
                job_id = %self.job.id(),
                step_id = %id,
                invoked_job = %pending.job_id,
                "invoked job no longer exists"
            );
            return self
                .fail_step(id, step, format!("invoked job {} not found", pending.job_id))
                .await;
        };
        match invoked.phase().await? {
            crate::queue::JobPhase::Completed => {
                let result = invoked.return_value().await?.unwrap_or(Value::Null);
                step.complete(result.clone())?;
                self.cell.persist(&*self.job).await?;
                Ok(StepOutcome::fresh(result))
            }
            crate::queue::JobPhase::Failed => {
                let message = format!("invoked job {} failed", pending.job_id);
                step.fail(&message)?;
                self.cell.with(|s| {
                    s.errors.push(JobErrorRecord {
                        step_id: id.to_string(),
                        message: message.clone(),
                        detail: None,
                    });
                });
                self.cell.persist(&*self.job).await?;
                Err(FlowError::InvokedJobFailed {
                    step_id: id.to_string(),
                    job_id: pending.job_id,
                })
            }
            _ => {
                // Still running; keep waiting.
                self.delay_self().await?;
                Err(FlowError::Suspended)
            }
        }
    }

    /// Park this job for one invoke-poll interval.
    async fn delay_self(&self) -> Result<(), FlowError> {
        self.job
            .move_to_delayed(
                now_ms() + self.invoke_poll_interval.as_millis() as u64,
                &self.token,
            )
            .await?;
        Ok(())
    }

    /// Record a step failure in the step and the job's error list, persist,
    /// and surface it so the queue's retry policy applies.
    async fn fail_step(
        &self,
        id: &str,
        step: &crate::state::StepHandle,
        message: String,
    ) -> Result<StepOutcome, FlowError> {
        step.fail(&message)?;
        self.cell.with(|s| {
            s.errors.push(JobErrorRecord {
                step_id: id.to_string(),
                message: message.clone(),
                detail: None,
            });
        });
        self.cell.persist(&*self.job).await?;
        Err(FlowError::StepFailed {
            step_id: id.to_string(),
            message,
        })
    }
}
