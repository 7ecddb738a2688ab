//! Workflow declarations and the client-wide registry.
//!
//! A [`Workflow`] pairs a unique id (which doubles as its queue name) with
//! a handler function and an input schema. Typed declarations derive the
//! schema from the input type's serde implementation; raw declarations
//! accept any JSON payload. Job options attach at three levels (client,
//! workflow, call-site) and are deep-merged eagerly, later levels winning
//! per field.

use crate::client::{ClientCore, ClientError};
use crate::context::WorkflowContext;
use crate::queue::{Deduplication, EnqueueOptions, WorkerOptions};
use crate::state::SourceSchema;
use crate::{codec, FlowError};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// Trait implemented by workflow handlers that can be invoked by a worker.
#[async_trait]
pub trait WorkflowHandler: Send + Sync {
    async fn invoke(&self, ctx: WorkflowContext, input: Value) -> Result<Value, FlowError>;
}

/// Function wrapper that implements [`WorkflowHandler`].
pub struct FnWorkflow<F, Fut>(pub F)
where
    F: Fn(WorkflowContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, FlowError>> + Send + 'static;

#[async_trait]
impl<F, Fut> WorkflowHandler for FnWorkflow<F, Fut>
where
    F: Fn(WorkflowContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, FlowError>> + Send + 'static,
{
    async fn invoke(&self, ctx: WorkflowContext, input: Value) -> Result<Value, FlowError> {
        (self.0)(ctx, input).await
    }
}

/// Accepts any payload unchanged.
struct PassthroughSchema;

impl SourceSchema for PassthroughSchema {
    fn validate(&self, value: Value) -> Result<Value, String> {
        Ok(value)
    }
}

/// Validates payloads by decoding them into `In`.
struct TypedSchema<In> {
    _marker: PhantomData<fn() -> In>,
}

impl<In: DeserializeOwned> SourceSchema for TypedSchema<In> {
    fn validate(&self, value: Value) -> Result<Value, String> {
        serde_json::from_value::<In>(value.clone()).map_err(|e| e.to_string())?;
        Ok(value)
    }
}

/// FIFO/LIFO delivery order for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOrder {
    Fifo,
    Lifo,
}

/// Per-job options. Unset fields inherit from the workflow's defaults,
/// which in turn inherit from the client's.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobOptions {
    /// Additional delivery attempts after a failed dispatch.
    pub retries: Option<u32>,
    /// Initial delay before the job becomes available.
    pub delay: Option<Duration>,
    /// Scheduling priority; lower values are delivered first.
    pub priority: Option<i64>,
    /// FIFO (default) or LIFO insertion into the waiting set.
    pub order: Option<JobOrder>,
    /// Deduplication window.
    pub deduplication: Option<Deduplication>,
    /// Caller-chosen job id; enqueueing an existing id returns that job.
    pub unique_job_id: Option<String>,
}

impl JobOptions {
    /// Field-wise merge: fields set in `over` win over `base`.
    pub fn overlay(base: &JobOptions, over: &JobOptions) -> JobOptions {
        JobOptions {
            retries: over.retries.or(base.retries),
            delay: over.delay.or(base.delay),
            priority: over.priority.or(base.priority),
            order: over.order.or(base.order),
            deduplication: over
                .deduplication
                .clone()
                .or_else(|| base.deduplication.clone()),
            unique_job_id: over
                .unique_job_id
                .clone()
                .or_else(|| base.unique_job_id.clone()),
        }
    }

    pub(crate) fn to_enqueue(&self) -> EnqueueOptions {
        EnqueueOptions {
            delay: self.delay,
            priority: self.priority.unwrap_or(0),
            lifo: self.order == Some(JobOrder::Lifo),
            retries: self.retries.unwrap_or(0),
            deduplication: self.deduplication.clone(),
            job_id: self.unique_job_id.clone(),
        }
    }
}

/// Handle to an enqueued job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedJob {
    pub job_id: String,
}

/// A named durable workflow: id, input schema, handler, and defaults.
///
/// The id is also the workflow's queue name and must be unique per client.
pub struct Workflow {
    id: String,
    handler: Arc<dyn WorkflowHandler>,
    schema: Arc<dyn SourceSchema>,
    job_options: JobOptions,
    worker_options: Option<WorkerOptions>,
    client: Mutex<Weak<ClientCore>>,
}

impl Workflow {
    /// Declare a workflow over raw JSON payloads (any payload is accepted).
    pub fn raw<F, Fut>(id: impl Into<String>, f: F) -> Self
    where
        F: Fn(WorkflowContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, FlowError>> + Send + 'static,
    {
        Self {
            id: id.into(),
            handler: Arc::new(FnWorkflow(f)),
            schema: Arc::new(PassthroughSchema),
            job_options: JobOptions::default(),
            worker_options: None,
            client: Mutex::new(Weak::new()),
        }
    }

    /// Declare a typed workflow: the serde shape of `In` is the payload
    /// schema, and the handler's `Out` is encoded as the job return value.
    pub fn typed<In, Out, F, Fut>(id: impl Into<String>, f: F) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(WorkflowContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<Out, FlowError>> + Send + 'static,
    {
        let id = id.into();
        let workflow_id = id.clone();
        let wrapper = move |ctx: WorkflowContext, input: Value| {
            let f = f.clone();
            let workflow_id = workflow_id.clone();
            async move {
                let decoded: In = codec::decode(input).map_err(|message| {
                    FlowError::State(crate::StateError::SchemaMismatch {
                        workflow_id,
                        message,
                    })
                })?;
                let out = f(ctx, decoded).await?;
                codec::encode(&out)
                    .map_err(|e| FlowError::State(crate::StateError::Serialization(e)))
            }
        };
        Self {
            id,
            handler: Arc::new(FnWorkflow(wrapper)),
            schema: Arc::new(TypedSchema::<In> {
                _marker: PhantomData,
            }),
            job_options: JobOptions::default(),
            worker_options: None,
            client: Mutex::new(Weak::new()),
        }
    }

    /// Attach workflow-level job option defaults.
    pub fn with_job_options(mut self, opts: JobOptions) -> Self {
        self.job_options = opts;
        self
    }

    /// Override the client's worker configuration for this workflow.
    pub fn with_worker_options(mut self, opts: WorkerOptions) -> Self {
        self.worker_options = Some(opts);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn schema(&self) -> &dyn SourceSchema {
        &*self.schema
    }

    pub(crate) fn handler(&self) -> Arc<dyn WorkflowHandler> {
        Arc::clone(&self.handler)
    }

    pub(crate) fn job_options(&self) -> &JobOptions {
        &self.job_options
    }

    pub(crate) fn worker_options(&self) -> Option<&WorkerOptions> {
        self.worker_options.as_ref()
    }

    /// The client injects itself here at `init` as a weak handle, used only
    /// for id-to-workflow lookup during `invoke` and for `create_job`.
    pub(crate) fn bind_client(&self, core: Weak<ClientCore>) {
        *self.client.lock().expect("workflow mutex poisoned") = core;
    }

    /// Enqueue one invocation of this workflow. The payload is validated
    /// eagerly, so a schema mismatch surfaces to the caller here.
    pub async fn create_job(
        &self,
        data: Value,
        opts: Option<JobOptions>,
    ) -> Result<CreatedJob, ClientError> {
        let core = self
            .client
            .lock()
            .expect("workflow mutex poisoned")
            .upgrade()
            .ok_or(ClientError::NotInitialized)?;
        core.create_job(&self.id, data, opts).await
    }
}

/// Immutable id-to-workflow registry shared by a client.
#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    inner: Arc<HashMap<String, Arc<Workflow>>>,
}

impl WorkflowRegistry {
    pub fn builder() -> WorkflowRegistryBuilder {
        WorkflowRegistryBuilder {
            map: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Workflow>> {
        self.inner.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.inner.keys().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&String, &Arc<Workflow>)> {
        self.inner.iter()
    }
}

/// Builder collecting workflows; duplicate ids are registration errors.
pub struct WorkflowRegistryBuilder {
    map: HashMap<String, Arc<Workflow>>,
    errors: Vec<String>,
}

impl WorkflowRegistryBuilder {
    pub fn register(mut self, workflow: Workflow) -> Self {
        let id = workflow.id().to_string();
        if self.map.contains_key(&id) {
            self.errors.push(format!("duplicate workflow: {id}"));
            return self;
        }
        self.map.insert(id, Arc::new(workflow));
        self
    }

    pub fn build(self) -> WorkflowRegistry {
        WorkflowRegistry {
            inner: Arc::new(self.map),
        }
    }

    /// Build the registry, failing if any registration errored.
    pub fn build_result(self) -> Result<WorkflowRegistry, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Payload {
        #[allow(dead_code)]
        number: i64,
    }

    fn noop_raw(id: &str) -> Workflow {
        Workflow::raw(id, |_ctx, _data| async move { Ok(Value::Null) })
    }

    #[test]
    fn overlay_prefers_later_levels() {
        let client = JobOptions {
            retries: Some(3),
            priority: Some(5),
            ..JobOptions::default()
        };
        let workflow = JobOptions {
            priority: Some(1),
            order: Some(JobOrder::Lifo),
            ..JobOptions::default()
        };
        let job = JobOptions {
            order: Some(JobOrder::Fifo),
            ..JobOptions::default()
        };
        let merged = JobOptions::overlay(&JobOptions::overlay(&client, &workflow), &job);
        assert_eq!(merged.retries, Some(3));
        assert_eq!(merged.priority, Some(1));
        assert_eq!(merged.order, Some(JobOrder::Fifo));
    }

    #[test]
    fn to_enqueue_fills_defaults() {
        let opts = JobOptions::default().to_enqueue();
        assert_eq!(opts.priority, 0);
        assert_eq!(opts.retries, 0);
        assert!(!opts.lifo);
        assert!(opts.delay.is_none());
    }

    #[test]
    fn typed_schema_rejects_bad_payloads() {
        let schema = TypedSchema::<Payload> {
            _marker: PhantomData,
        };
        assert!(schema.validate(json!({ "number": 21 })).is_ok());
        assert!(schema.validate(json!({ "number": "x" })).is_err());
        assert!(schema.validate(json!("nope")).is_err());
    }

    #[test]
    fn registry_rejects_duplicate_ids() {
        let result = WorkflowRegistry::builder()
            .register(noop_raw("a"))
            .register(noop_raw("a"))
            .build_result();
        assert!(result.is_err());
    }

    #[test]
    fn registry_lookup_by_id() {
        let registry = WorkflowRegistry::builder()
            .register(noop_raw("a"))
            .register(noop_raw("b"))
            .build();
        assert_eq!(registry.count(), 2);
        assert!(registry.get("a").is_some());
        assert!(registry.get("missing").is_none());
    }
}
