//! Client: workflow lifecycle and job creation.
//!
//! A [`Client`] binds a queue adapter to a registry of workflows. `init`
//! injects the client into each workflow as a weak handle (used for
//! id-to-workflow lookup during `invoke` and for `create_job`); `start`
//! spawns one worker per workflow. The client communicates with workers
//! only through the shared queue, so jobs can also be enqueued from a
//! process that runs no workers at all.

use crate::executor::JobExecutor;
use crate::queue::{
    HandlerError, Job, JobHandler, Queue, QueueError, WorkerHandle, WorkerOptions,
};
use crate::workflow::{CreatedJob, JobOptions, Workflow, WorkflowRegistry};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, info};

/// Priority assigned to a job when a sleep parks it, so post-delay
/// processing is ordered after fresh arrivals.
const DEFAULT_DELAYED_RUN_PRIORITY: i64 = 1_000;

/// Poll backstop for invocation waits; promotion is the fast path.
const DEFAULT_INVOKE_POLL_INTERVAL_MS: u64 = 1_000;

/// Client-level configuration.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Queue-name prefix (`{prefix}:{workflow_id}`); no prefix when unset.
    pub prefix: Option<String>,
    /// Job option defaults merged under every workflow's own defaults.
    pub default_job_options: JobOptions,
    /// Priority given to jobs parked by a sleep step.
    pub delayed_run_priority: i64,
    /// Self-delay between invocation-wait polls.
    pub invoke_poll_interval: Duration,
    /// Worker configuration for workflows without their own.
    pub worker: WorkerOptions,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            prefix: None,
            default_job_options: JobOptions::default(),
            delayed_run_priority: DEFAULT_DELAYED_RUN_PRIORITY,
            invoke_poll_interval: Duration::from_millis(DEFAULT_INVOKE_POLL_INTERVAL_MS),
            worker: WorkerOptions::default(),
        }
    }
}

/// Errors surfaced by the client API.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientError {
    /// The queue adapter failed.
    Queue(QueueError),

    /// The payload did not satisfy the workflow's input schema.
    SchemaMismatch {
        workflow_id: String,
        message: String,
    },

    /// No workflow with this id is registered in this client.
    UnknownWorkflow { workflow_id: String },

    /// The workflow was used before `init` bound it to a client.
    NotInitialized,
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Queue(e) => write!(f, "{e}"),
            ClientError::SchemaMismatch {
                workflow_id,
                message,
            } => write!(f, "payload rejected by schema of {workflow_id}: {message}"),
            ClientError::UnknownWorkflow { workflow_id } => {
                write!(f, "unknown workflow: {workflow_id}")
            }
            ClientError::NotInitialized => {
                write!(f, "workflow is not bound to a client; call init() first")
            }
        }
    }
}

impl std::error::Error for ClientError {}

impl From<QueueError> for ClientError {
    fn from(e: QueueError) -> Self {
        ClientError::Queue(e)
    }
}

/// Shared state behind a client: the queue adapter, the workflow map, and
/// the resolved options. Workflows hold this only weakly, so there is no
/// ownership cycle.
pub(crate) struct ClientCore {
    queue: Arc<dyn Queue>,
    workflows: HashMap<String, Arc<Workflow>>,
    options: ClientOptions,
}

impl ClientCore {
    pub(crate) fn queue(&self) -> &Arc<dyn Queue> {
        &self.queue
    }

    pub(crate) fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub(crate) fn workflow(&self, id: &str) -> Option<Arc<Workflow>> {
        self.workflows.get(id).cloned()
    }

    pub(crate) fn queue_name(&self, workflow_id: &str) -> String {
        match &self.options.prefix {
            Some(prefix) => format!("{prefix}:{workflow_id}"),
            None => workflow_id.to_string(),
        }
    }

    /// Validate the payload eagerly, merge the three option levels, and
    /// enqueue.
    pub(crate) async fn create_job(
        &self,
        workflow_id: &str,
        data: Value,
        opts: Option<JobOptions>,
    ) -> Result<CreatedJob, ClientError> {
        let workflow = self
            .workflow(workflow_id)
            .ok_or_else(|| ClientError::UnknownWorkflow {
                workflow_id: workflow_id.to_string(),
            })?;
        let validated =
            workflow
                .schema()
                .validate(data)
                .map_err(|message| ClientError::SchemaMismatch {
                    workflow_id: workflow_id.to_string(),
                    message,
                })?;
        let effective = JobOptions::overlay(
            &JobOptions::overlay(&self.options.default_job_options, workflow.job_options()),
            &opts.unwrap_or_default(),
        );
        let job_id = self
            .queue
            .enqueue(
                &self.queue_name(workflow_id),
                validated,
                &effective.to_enqueue(),
            )
            .await?;
        debug!(workflow = %workflow_id, job_id = %job_id, "job created");
        Ok(CreatedJob { job_id })
    }
}

/// Worker-side glue: one dispatch becomes one [`JobExecutor`] run, and the
/// flow outcome is mapped onto the queue's reserved sentinels.
struct WorkflowJobHandler {
    workflow: Arc<Workflow>,
    core: Weak<ClientCore>,
}

#[async_trait]
impl JobHandler for WorkflowJobHandler {
    async fn process(&self, job: Arc<dyn Job>, token: &str) -> Result<Value, HandlerError> {
        let executor = JobExecutor::new(
            Arc::clone(&self.workflow),
            self.core.clone(),
            job,
            token.to_string(),
        );
        executor.execute().await.map_err(HandlerError::from)
    }
}

/// Entry point tying a queue adapter to a set of workflows.
pub struct Client {
    core: Arc<ClientCore>,
    workers: Mutex<Vec<WorkerHandle>>,
    initialized: AtomicBool,
    started: AtomicBool,
}

impl Client {
    pub fn new(queue: Arc<dyn Queue>, registry: WorkflowRegistry, options: ClientOptions) -> Self {
        // Install a default subscriber if none is set (ok to call many times).
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .try_init();

        let workflows: HashMap<String, Arc<Workflow>> = registry
            .iter()
            .map(|(id, wf)| (id.clone(), Arc::clone(wf)))
            .collect();
        Self {
            core: Arc::new(ClientCore {
                queue,
                workflows,
                options,
            }),
            workers: Mutex::new(Vec::new()),
            initialized: AtomicBool::new(false),
            started: AtomicBool::new(false),
        }
    }

    /// Inject the client handle into every registered workflow. Idempotent;
    /// called implicitly by `start`.
    pub fn init(&self) {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return;
        }
        for workflow in self.core.workflows.values() {
            workflow.bind_client(Arc::downgrade(&self.core));
        }
        info!(
            adapter = %self.core.queue.name(),
            workflows = self.core.workflows.len(),
            "client initialized"
        );
    }

    /// Spawn one worker per workflow and begin processing. Calling `start`
    /// on a paused client resumes its workers instead.
    pub async fn start(&self) -> Result<(), ClientError> {
        self.init();
        if self.started.swap(true, Ordering::SeqCst) {
            for worker in self.workers.lock().expect("client mutex poisoned").iter() {
                worker.resume();
            }
            return Ok(());
        }
        for (id, workflow) in &self.core.workflows {
            let handler: Arc<dyn JobHandler> = Arc::new(WorkflowJobHandler {
                workflow: Arc::clone(workflow),
                core: Arc::downgrade(&self.core),
            });
            let opts = workflow
                .worker_options()
                .cloned()
                .unwrap_or_else(|| self.core.options.worker.clone());
            let handle = self
                .core
                .queue
                .spawn_worker(
                    &self.core.queue_name(id),
                    handler,
                    WorkerOptions {
                        autorun: false,
                        ..opts
                    },
                )
                .await?;
            handle.resume();
            self.workers
                .lock()
                .expect("client mutex poisoned")
                .push(handle);
        }
        info!(workflows = self.core.workflows.len(), "client started");
        Ok(())
    }

    /// Stop picking up new jobs; in-flight dispatches finish.
    pub fn pause(&self) {
        for worker in self.workers.lock().expect("client mutex poisoned").iter() {
            worker.pause();
        }
    }

    /// Terminate all workers. In-flight jobs are re-delivered by the queue.
    pub fn stop(&self) {
        let mut workers = self.workers.lock().expect("client mutex poisoned");
        for worker in workers.drain(..) {
            worker.stop();
        }
        self.started.store(false, Ordering::SeqCst);
    }

    pub fn get_workflow(&self, id: &str) -> Option<Arc<Workflow>> {
        self.core.workflow(id)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.stop();
    }
}
