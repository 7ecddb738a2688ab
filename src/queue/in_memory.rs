//! In-memory queue adapter.
//!
//! Implements the full [`Queue`]/[`Job`] contract against process-local
//! state: priority-then-order scheduling (FIFO/LIFO), a delayed set with
//! due-time promotion, per-job retry counting with a fixed backoff,
//! deduplication windows, fixed job ids, and worker loops with a
//! concurrency cap and optional rate limiter. Used by the test-suite and
//! by embedded deployments; nothing survives the process.

use super::{
    Deduplication, EnqueueOptions, HandlerError, Job, JobHandler, JobPhase, Queue, QueueError,
    WorkerHandle, WorkerOptions,
};
use crate::now_ms;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

/// Idle sleep between scheduling polls.
const POLL_INTERVAL_MS: u64 = 10;

/// Delay before a failed dispatch is re-delivered.
const RETRY_BACKOFF_MS: u64 = 25;

pub struct InMemoryQueue {
    shared: Arc<Shared>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                queues: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                next_token: AtomicU64::new(1),
            }),
        }
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

struct Shared {
    queues: Mutex<HashMap<String, QueueData>>,
    next_id: AtomicU64,
    next_token: AtomicU64,
}

#[derive(Default)]
struct QueueData {
    jobs: HashMap<String, JobRecord>,
    /// Waiting job ids in insertion order; the scheduler picks the lowest
    /// priority value, first-inserted wins ties.
    waiting: Vec<String>,
    dedup: HashMap<String, DedupEntry>,
}

struct DedupEntry {
    job_id: String,
    expires_at: u64,
}

struct JobRecord {
    data: Value,
    phase: JobPhase,
    priority: i64,
    retries: u32,
    attempts_made: u32,
    delay_until: Option<u64>,
    return_value: Option<Value>,
    failed_reason: Option<String>,
    active_token: Option<String>,
}

impl Shared {
    fn fresh_job_id(&self) -> String {
        format!("job-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn fresh_token(&self) -> String {
        format!("tok-{}", self.next_token.fetch_add(1, Ordering::SeqCst))
    }

    async fn enqueue(
        &self,
        queue: &str,
        data: Value,
        opts: &EnqueueOptions,
    ) -> Result<String, QueueError> {
        let mut queues = self.queues.lock().await;
        let qd = queues.entry(queue.to_string()).or_default();
        let now = now_ms();

        if let Some(Deduplication { ttl, id }) = &opts.deduplication {
            match qd.dedup.get(id) {
                Some(entry) if entry.expires_at > now && qd.jobs.contains_key(&entry.job_id) => {
                    debug!(queue, dedup_id = %id, job_id = %entry.job_id, "enqueue deduplicated");
                    return Ok(entry.job_id.clone());
                }
                _ => {
                    let job_id = opts
                        .job_id
                        .clone()
                        .unwrap_or_else(|| self.fresh_job_id());
                    if qd.jobs.contains_key(&job_id) {
                        return Ok(job_id);
                    }
                    qd.dedup.insert(
                        id.clone(),
                        DedupEntry {
                            job_id: job_id.clone(),
                            expires_at: now + ttl.as_millis() as u64,
                        },
                    );
                    return Ok(Self::insert_job(qd, queue, job_id, data, opts, now));
                }
            }
        }

        if let Some(job_id) = &opts.job_id {
            if qd.jobs.contains_key(job_id) {
                debug!(queue, job_id = %job_id, "enqueue reused existing job id");
                return Ok(job_id.clone());
            }
            return Ok(Self::insert_job(qd, queue, job_id.clone(), data, opts, now));
        }

        let job_id = self.fresh_job_id();
        Ok(Self::insert_job(qd, queue, job_id, data, opts, now))
    }

    fn insert_job(
        qd: &mut QueueData,
        queue: &str,
        job_id: String,
        data: Value,
        opts: &EnqueueOptions,
        now: u64,
    ) -> String {
        let delayed = opts.delay.filter(|d| !d.is_zero());
        let record = JobRecord {
            data,
            phase: if delayed.is_some() {
                JobPhase::Delayed
            } else {
                JobPhase::Waiting
            },
            priority: opts.priority,
            retries: opts.retries,
            attempts_made: 0,
            delay_until: delayed.map(|d| now + d.as_millis() as u64),
            return_value: None,
            failed_reason: None,
            active_token: None,
        };
        if record.phase == JobPhase::Waiting {
            if opts.lifo {
                qd.waiting.insert(0, job_id.clone());
            } else {
                qd.waiting.push(job_id.clone());
            }
        }
        debug!(queue, job_id = %job_id, phase = ?record.phase, "job enqueued");
        qd.jobs.insert(job_id.clone(), record);
        job_id
    }

    /// Promote due delayed jobs, then hand out the best waiting job as an
    /// active dispatch with a fresh token.
    async fn pick_next(&self, queue: &str) -> Option<(String, String)> {
        let mut queues = self.queues.lock().await;
        let qd = queues.get_mut(queue)?;
        let now = now_ms();

        let due: Vec<String> = qd
            .jobs
            .iter()
            .filter(|(_, r)| {
                r.phase == JobPhase::Delayed && r.delay_until.map(|t| t <= now).unwrap_or(true)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in due {
            if let Some(record) = qd.jobs.get_mut(&id) {
                record.phase = JobPhase::Waiting;
                record.delay_until = None;
                qd.waiting.push(id);
            }
        }

        let mut best: Option<(usize, i64)> = None;
        for (idx, id) in qd.waiting.iter().enumerate() {
            let Some(record) = qd.jobs.get(id) else { continue };
            if record.phase != JobPhase::Waiting {
                continue;
            }
            if best.map(|(_, p)| record.priority < p).unwrap_or(true) {
                best = Some((idx, record.priority));
            }
        }
        let (idx, _) = best?;
        let job_id = qd.waiting.remove(idx);
        let token = self.fresh_token();
        let record = qd.jobs.get_mut(&job_id)?;
        record.phase = JobPhase::Active;
        record.attempts_made += 1;
        record.active_token = Some(token.clone());
        Some((job_id, token))
    }

    /// Apply a handler outcome to the job record.
    async fn finalize(&self, queue: &str, job_id: &str, outcome: Result<Value, HandlerError>) {
        let mut queues = self.queues.lock().await;
        let Some(qd) = queues.get_mut(queue) else { return };
        let Some(record) = qd.jobs.get_mut(job_id) else { return };
        record.active_token = None;
        match outcome {
            Ok(value) => {
                record.phase = JobPhase::Completed;
                record.return_value = Some(value);
                debug!(queue, job_id, "job completed");
            }
            Err(HandlerError::Suspended) => {
                // The handler moved the job to the delayed set (or it was
                // promoted in the meantime); only an untouched active job
                // means the suspend contract was violated.
                if record.phase == JobPhase::Active {
                    warn!(queue, job_id, "suspended dispatch left job active; requeueing");
                    record.phase = JobPhase::Waiting;
                    qd.waiting.push(job_id.to_string());
                }
            }
            Err(HandlerError::Unrecoverable(reason)) => {
                record.phase = JobPhase::Failed;
                record.failed_reason = Some(reason);
                debug!(queue, job_id, "job failed terminally");
            }
            Err(HandlerError::Failed(reason)) => {
                if record.attempts_made <= record.retries {
                    record.phase = JobPhase::Delayed;
                    record.delay_until = Some(now_ms() + RETRY_BACKOFF_MS);
                    debug!(
                        queue,
                        job_id,
                        attempts = record.attempts_made,
                        retries = record.retries,
                        "dispatch failed; backing off for retry"
                    );
                } else {
                    record.phase = JobPhase::Failed;
                    record.failed_reason = Some(reason);
                    debug!(queue, job_id, "job failed after exhausting retries");
                }
            }
        }
    }

    async fn with_record<R>(
        &self,
        operation: &str,
        queue: &str,
        job_id: &str,
        f: impl FnOnce(&mut QueueData, &str) -> R,
    ) -> Result<R, QueueError> {
        let mut queues = self.queues.lock().await;
        let qd = queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::permanent(operation, format!("unknown queue: {queue}")))?;
        if !qd.jobs.contains_key(job_id) {
            return Err(QueueError::permanent(
                operation,
                format!("job not found: {queue}/{job_id}"),
            ));
        }
        Ok(f(qd, job_id))
    }
}

struct InMemoryJob {
    id: String,
    queue: String,
    shared: Arc<Shared>,
}

#[async_trait]
impl Job for InMemoryJob {
    fn id(&self) -> &str {
        &self.id
    }

    fn queue_name(&self) -> &str {
        &self.queue
    }

    async fn data(&self) -> Result<Value, QueueError> {
        self.shared
            .with_record("data", &self.queue, &self.id, |qd, id| {
                qd.jobs[id].data.clone()
            })
            .await
    }

    async fn update_data(&self, data: Value) -> Result<(), QueueError> {
        self.shared
            .with_record("update_data", &self.queue, &self.id, |qd, id| {
                if let Some(record) = qd.jobs.get_mut(id) {
                    record.data = data;
                }
            })
            .await
    }

    async fn move_to_delayed(&self, until_ms: u64, token: &str) -> Result<(), QueueError> {
        self.shared
            .with_record("move_to_delayed", &self.queue, &self.id, |qd, id| {
                let Some(record) = qd.jobs.get_mut(id) else {
                    return Err(QueueError::permanent(
                        "move_to_delayed",
                        format!("job not found: {id}"),
                    ));
                };
                if record.phase != JobPhase::Active {
                    return Err(QueueError::permanent(
                        "move_to_delayed",
                        format!("job {id} is not active"),
                    ));
                }
                if record.active_token.as_deref() != Some(token) {
                    return Err(QueueError::permanent(
                        "move_to_delayed",
                        format!("lock token mismatch for job {id}"),
                    ));
                }
                record.phase = JobPhase::Delayed;
                record.delay_until = Some(until_ms);
                Ok(())
            })
            .await?
    }

    async fn change_priority(&self, priority: i64) -> Result<(), QueueError> {
        self.shared
            .with_record("change_priority", &self.queue, &self.id, |qd, id| {
                if let Some(record) = qd.jobs.get_mut(id) {
                    record.priority = priority;
                }
            })
            .await
    }

    async fn promote(&self) -> Result<(), QueueError> {
        self.shared
            .with_record("promote", &self.queue, &self.id, |qd, id| {
                let Some(record) = qd.jobs.get_mut(id) else {
                    return Err(QueueError::permanent(
                        "promote",
                        format!("job not found: {id}"),
                    ));
                };
                if record.phase == JobPhase::Delayed {
                    record.phase = JobPhase::Waiting;
                    record.delay_until = None;
                    qd.waiting.push(id.to_string());
                }
                Ok(())
            })
            .await?
    }

    async fn phase(&self) -> Result<JobPhase, QueueError> {
        self.shared
            .with_record("phase", &self.queue, &self.id, |qd, id| qd.jobs[id].phase)
            .await
    }

    async fn return_value(&self) -> Result<Option<Value>, QueueError> {
        self.shared
            .with_record("return_value", &self.queue, &self.id, |qd, id| {
                qd.jobs[id].return_value.clone()
            })
            .await
    }

    async fn attempts_made(&self) -> Result<u32, QueueError> {
        self.shared
            .with_record("attempts_made", &self.queue, &self.id, |qd, id| {
                qd.jobs[id].attempts_made
            })
            .await
    }
}

#[async_trait]
impl Queue for InMemoryQueue {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn enqueue(
        &self,
        queue: &str,
        data: Value,
        opts: &EnqueueOptions,
    ) -> Result<String, QueueError> {
        self.shared.enqueue(queue, data, opts).await
    }

    async fn job(&self, queue: &str, id: &str) -> Result<Option<Arc<dyn Job>>, QueueError> {
        let queues = self.shared.queues.lock().await;
        let exists = queues
            .get(queue)
            .map(|qd| qd.jobs.contains_key(id))
            .unwrap_or(false);
        Ok(exists.then(|| {
            Arc::new(InMemoryJob {
                id: id.to_string(),
                queue: queue.to_string(),
                shared: Arc::clone(&self.shared),
            }) as Arc<dyn Job>
        }))
    }

    async fn delayed_jobs(&self, queue: &str) -> Result<Vec<Arc<dyn Job>>, QueueError> {
        let queues = self.shared.queues.lock().await;
        let Some(qd) = queues.get(queue) else {
            return Ok(Vec::new());
        };
        Ok(qd
            .jobs
            .iter()
            .filter(|(_, r)| r.phase == JobPhase::Delayed)
            .map(|(id, _)| {
                Arc::new(InMemoryJob {
                    id: id.clone(),
                    queue: queue.to_string(),
                    shared: Arc::clone(&self.shared),
                }) as Arc<dyn Job>
            })
            .collect())
    }

    async fn spawn_worker(
        &self,
        queue: &str,
        handler: Arc<dyn JobHandler>,
        opts: WorkerOptions,
    ) -> Result<WorkerHandle, QueueError> {
        let handle = WorkerHandle::new(opts.autorun);
        let paused = handle.paused_flag();
        let stopped = handle.stopped_flag();
        let shared = Arc::clone(&self.shared);
        let queue = queue.to_string();
        let semaphore = Arc::new(Semaphore::new(opts.concurrency.max(1)));
        let limiter = opts.limiter.clone();

        let join = tokio::spawn(async move {
            let mut dispatch_times: Vec<u64> = Vec::new();
            loop {
                if stopped.load(Ordering::SeqCst) {
                    break;
                }
                if paused.load(Ordering::SeqCst) {
                    idle().await;
                    continue;
                }
                if let Some(limit) = &limiter {
                    let window_start =
                        now_ms().saturating_sub(limit.duration.as_millis() as u64);
                    dispatch_times.retain(|t| *t >= window_start);
                    if dispatch_times.len() >= limit.max as usize {
                        idle().await;
                        continue;
                    }
                }
                let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                    idle().await;
                    continue;
                };
                match shared.pick_next(&queue).await {
                    Some((job_id, token)) => {
                        dispatch_times.push(now_ms());
                        let shared = Arc::clone(&shared);
                        let handler = Arc::clone(&handler);
                        let queue = queue.clone();
                        tokio::spawn(async move {
                            let job: Arc<dyn Job> = Arc::new(InMemoryJob {
                                id: job_id.clone(),
                                queue: queue.clone(),
                                shared: Arc::clone(&shared),
                            });
                            let outcome = handler.process(job, &token).await;
                            shared.finalize(&queue, &job_id, outcome).await;
                            drop(permit);
                        });
                    }
                    None => {
                        drop(permit);
                        idle().await;
                    }
                }
            }
        });
        handle.attach(join);
        Ok(handle)
    }
}

async fn idle() {
    tokio::time::sleep(std::time::Duration::from_millis(POLL_INTERVAL_MS)).await;
}
