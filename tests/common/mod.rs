use restep::queue::in_memory::InMemoryQueue;
use restep::queue::{Job, JobPhase, Queue};
use restep::{Client, ClientOptions, JobState, Workflow, WorkflowRegistry};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct Harness {
    pub client: Arc<Client>,
    pub queue: Arc<InMemoryQueue>,
}

/// Build a client over a fresh in-memory queue and start its workers.
#[allow(dead_code)]
pub async fn start_client(workflows: Vec<Workflow>) -> Harness {
    start_client_with(workflows, ClientOptions::default()).await
}

#[allow(dead_code)]
pub async fn start_client_with(workflows: Vec<Workflow>, options: ClientOptions) -> Harness {
    let mut builder = WorkflowRegistry::builder();
    for workflow in workflows {
        builder = builder.register(workflow);
    }
    let registry = builder.build_result().expect("workflow registration");
    let queue = Arc::new(InMemoryQueue::new());
    let client = Arc::new(Client::new(queue.clone(), registry, options));
    client.start().await.expect("client start");
    Harness { client, queue }
}

/// Poll until the job reaches `phase` or the deadline passes.
#[allow(dead_code)]
pub async fn wait_for_phase(
    queue: &Arc<InMemoryQueue>,
    queue_name: &str,
    job_id: &str,
    phase: JobPhase,
    timeout_ms: u64,
) -> bool {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if let Ok(Some(job)) = queue.job(queue_name, job_id).await {
            if job.phase().await == Ok(phase) {
                return true;
            }
        }
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Poll until the job completes; returns its return value.
#[allow(dead_code)]
pub async fn wait_for_return_value(
    queue: &Arc<InMemoryQueue>,
    queue_name: &str,
    job_id: &str,
    timeout_ms: u64,
) -> Option<Value> {
    if !wait_for_phase(queue, queue_name, job_id, JobPhase::Completed, timeout_ms).await {
        return None;
    }
    let job = queue.job(queue_name, job_id).await.ok()??;
    job.return_value().await.ok()?
}

/// Parse the job's data slot as the engine's state record.
#[allow(dead_code)]
pub async fn job_state(queue: &Arc<InMemoryQueue>, queue_name: &str, job_id: &str) -> JobState {
    let job = queue
        .job(queue_name, job_id)
        .await
        .expect("queue lookup")
        .expect("job exists");
    let data = job.data().await.expect("job data");
    serde_json::from_value(data).expect("job data parses as JobState")
}
