//! Per-dispatch driver.
//!
//! `JobExecutor` owns one wake-up of one job: it reconstructs the job
//! state from the job's data slot, binds a fresh step engine into the
//! context, runs the workflow function, promotes waiting callers on clean
//! completion, and always persists the state record before the outcome
//! reaches the queue. That last point carries the suspension contract:
//! the post-suspension data write commits before the queue observes the
//! sentinel.

use crate::client::ClientCore;
use crate::context::WorkflowContext;
use crate::queue::Job;
use crate::state::{InvocationSubscription, JobState, PendingInvocation, StateCell, StepStatus};
use crate::step::StepEngine;
use crate::workflow::Workflow;
use crate::{codec, now_ms, FlowError};
use serde_json::Value;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

pub(crate) struct JobExecutor {
    workflow: Arc<Workflow>,
    core: Weak<ClientCore>,
    job: Arc<dyn Job>,
    token: String,
}

impl JobExecutor {
    pub(crate) fn new(
        workflow: Arc<Workflow>,
        core: Weak<ClientCore>,
        job: Arc<dyn Job>,
        token: String,
    ) -> Self {
        Self {
            workflow,
            core,
            job,
            token,
        }
    }

    /// Drive one dispatch of the workflow function.
    pub(crate) async fn execute(&self) -> Result<Value, FlowError> {
        let core = self.core.upgrade().ok_or(FlowError::NotReady)?;
        let (_, cell) =
            StateCell::load(&*self.job, self.workflow.id(), self.workflow.schema()).await?;

        let attempts = cell.with(|s| {
            if s.metrics.started_at.is_none() {
                s.metrics.started_at = Some(now_ms());
            }
            s.metrics.attempts += 1;
            s.metrics.attempts
        });

        let ctx = WorkflowContext::new(
            self.job.id().to_string(),
            self.workflow.id().to_string(),
            attempts,
        );
        let engine = StepEngine::new(
            cell.clone(),
            Arc::clone(&self.job),
            self.token.clone(),
            self.workflow.id().to_string(),
            self.core.clone(),
            core.options().delayed_run_priority,
            core.options().invoke_poll_interval,
        );
        ctx.bind(Arc::new(engine));

        let source = cell.with(|s| s.source.clone());
        debug!(
            workflow = %self.workflow.id(),
            job_id = %self.job.id(),
            attempts,
            "dispatching workflow function"
        );
        let result = match self.workflow.handler().invoke(ctx.clone(), source).await {
            Ok(value) => {
                cell.with(|s| {
                    let completed_at = now_ms();
                    s.metrics.completed_at = Some(completed_at);
                    let started = s.metrics.started_at.unwrap_or(completed_at);
                    s.metrics.duration = Some(completed_at.saturating_sub(started));
                });
                self.notify_subscribers(&core, &cell).await;
                Ok(value)
            }
            // The sentinels pass through unchanged: Suspended keeps the job
            // in the delayed set, Unrecoverable skips retry.
            Err(FlowError::Suspended) => Err(FlowError::Suspended),
            Err(FlowError::Unrecoverable(msg)) => {
                cell.with(|s| s.metrics.failed_at = Some(now_ms()));
                Err(FlowError::Unrecoverable(msg))
            }
            Err(e) => {
                cell.with(|s| s.metrics.failed_at = Some(now_ms()));
                warn!(
                    workflow = %self.workflow.id(),
                    job_id = %self.job.id(),
                    error = %e,
                    "workflow dispatch failed"
                );
                Err(e)
            }
        };

        // Always runs: drain durable logs and persist, so suspension-state
        // mutations are committed before the queue observes the outcome.
        cell.with(|s| s.logs.extend(ctx.drain_logs()));
        if let Err(e) = cell.persist(&*self.job).await {
            warn!(
                workflow = %self.workflow.id(),
                job_id = %self.job.id(),
                error = %e,
                "failed to persist job state at dispatch end"
            );
            if result.is_ok() {
                return Err(e);
            }
        }
        result
    }

    /// Promote every caller waiting on this job out of its delayed set.
    /// Failures here are logged and swallowed: the notifier job's own
    /// completion must not be affected.
    async fn notify_subscribers(&self, core: &Arc<ClientCore>, cell: &StateCell) {
        let subscribers = cell.with(|s| s.invocations.clone());
        for subscriber in subscribers {
            if let Err(e) = self.promote_caller(core, &subscriber).await {
                warn!(
                    job_id = %self.job.id(),
                    caller_workflow = %subscriber.caller_workflow_id,
                    caller_step = %subscriber.caller_step_id,
                    error = %e,
                    "failed to promote waiting caller"
                );
            }
        }
    }

    /// Scan the caller workflow's delayed set for the job whose invoke step
    /// is waiting on us, and promote it for immediate re-dispatch.
    async fn promote_caller(
        &self,
        core: &Arc<ClientCore>,
        subscriber: &InvocationSubscription,
    ) -> Result<(), FlowError> {
        let caller_queue = core.queue_name(&subscriber.caller_workflow_id);
        let delayed = core.queue().delayed_jobs(&caller_queue).await?;
        for job in delayed {
            let Ok(data) = job.data().await else { continue };
            let Ok(state) = serde_json::from_value::<JobState>(data) else {
                continue;
            };
            let Some(step) = state.steps.get(&subscriber.caller_step_id) else {
                continue;
            };
            if step.status != StepStatus::Delayed {
                continue;
            }
            let Ok(pending) = codec::decode::<PendingInvocation>(step.result.clone()) else {
                continue;
            };
            if pending.job_id == self.job.id() {
                job.promote().await?;
                debug!(
                    job_id = %self.job.id(),
                    caller_job = %job.id(),
                    caller_step = %subscriber.caller_step_id,
                    "promoted waiting caller"
                );
                return Ok(());
            }
        }
        debug!(
            job_id = %self.job.id(),
            caller_workflow = %subscriber.caller_workflow_id,
            "no delayed caller found; poll backstop will pick up the result"
        );
        Ok(())
    }
}
