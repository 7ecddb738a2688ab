//! Sleep round-trips through the delayed set.

mod common;

use restep::queue::JobPhase;
use restep::state::{StepKind, StepStatus};
use restep::Workflow;
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn sleep_parks_the_job_then_resumes() {
    let wf = Workflow::raw("sleeper", |ctx, _data| async move {
        ctx.sleep("s", Duration::from_millis(100)).await?;
        let out = ctx.run("r", || async { Ok(json!("done")) }).await?;
        Ok(out.result)
    });

    let h = common::start_client(vec![wf]).await;
    let workflow = h.client.get_workflow("sleeper").unwrap();
    let created = workflow.create_job(json!(null), None).await.unwrap();

    // First dispatch ends with the job in the delayed set and the sleep
    // step recorded as delayed.
    assert!(
        common::wait_for_phase(&h.queue, "sleeper", &created.job_id, JobPhase::Delayed, 1_000)
            .await,
        "job should enter the delayed set"
    );
    let state = common::job_state(&h.queue, "sleeper", &created.job_id).await;
    assert_eq!(state.steps["s"].kind, StepKind::Sleep);
    assert_eq!(state.steps["s"].status, StepStatus::Delayed);
    assert!(!state.steps.contains_key("r"), "run step must not exist yet");

    // After the delay the queue re-delivers; the sleep completes with true
    // and the rest of the workflow runs.
    let rv = common::wait_for_return_value(&h.queue, "sleeper", &created.job_id, 2_000)
        .await
        .expect("sleeper completes");
    assert_eq!(rv, json!("done"));

    let state = common::job_state(&h.queue, "sleeper", &created.job_id).await;
    assert_eq!(state.steps["s"].status, StepStatus::Completed);
    assert_eq!(state.steps["s"].result, json!(true));
    assert_eq!(state.steps["r"].result, json!("done"));
    assert_eq!(state.metrics.attempts, 2, "one dispatch per side of the delay");
}

#[tokio::test]
async fn sleep_until_a_past_timestamp_resumes_immediately() {
    let wf = Workflow::raw("past-sleeper", |ctx, _data| async move {
        // One hour ago: degenerates to an immediate re-entry.
        let past = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64
            - 3_600_000;
        ctx.sleep_until("s", past).await?;
        Ok(json!("woke"))
    });

    let h = common::start_client(vec![wf]).await;
    let workflow = h.client.get_workflow("past-sleeper").unwrap();
    let created = workflow.create_job(json!(null), None).await.unwrap();
    let rv = common::wait_for_return_value(&h.queue, "past-sleeper", &created.job_id, 2_000)
        .await
        .expect("past sleeper completes");
    assert_eq!(rv, json!("woke"));

    let state = common::job_state(&h.queue, "past-sleeper", &created.job_id).await;
    assert_eq!(state.steps["s"].kind, StepKind::SleepUntil);
    assert_eq!(state.steps["s"].status, StepStatus::Completed);
    assert_eq!(state.metrics.attempts, 2);
}

#[tokio::test]
async fn completed_sleep_replays_without_delaying_again() {
    let wf = Workflow::raw("resleeper", |ctx, _data| async move {
        let out = ctx.sleep("s", Duration::from_millis(50)).await?;
        assert!(out.result.as_bool().unwrap_or(false));
        Ok(json!("through"))
    });

    let h = common::start_client(vec![wf]).await;
    let workflow = h.client.get_workflow("resleeper").unwrap();
    let created = workflow.create_job(json!(null), None).await.unwrap();
    common::wait_for_return_value(&h.queue, "resleeper", &created.job_id, 2_000)
        .await
        .expect("first pass completes");

    // Re-dispatch the finished job data: the sleep step is already
    // completed, so the new job must finish in one dispatch.
    let job = h.queue.job("resleeper", &created.job_id).await.unwrap().unwrap();
    let data = job.data().await.unwrap();
    use restep::queue::{EnqueueOptions, Job, Queue};
    let replay_id = h
        .queue
        .enqueue("resleeper", data, &EnqueueOptions::default())
        .await
        .unwrap();
    let rv = common::wait_for_return_value(&h.queue, "resleeper", &replay_id, 2_000)
        .await
        .expect("replay completes");
    assert_eq!(rv, json!("through"));
    let state = common::job_state(&h.queue, "resleeper", &replay_id).await;
    assert_eq!(state.metrics.attempts, 3, "two original dispatches plus one replay");
}
