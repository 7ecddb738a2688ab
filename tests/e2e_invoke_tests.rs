//! Cross-workflow invocation: subscription, promotion, and failure.

mod common;

use restep::queue::JobPhase;
use restep::state::{PendingInvocation, StepStatus};
use restep::{ClientOptions, FlowError, JobOptions, Workflow};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};

#[derive(Deserialize)]
struct Doubling {
    number: i64,
}

fn caller() -> Workflow {
    Workflow::raw("caller", |ctx, _data| async move {
        let out = ctx.invoke("call-b", "doubler", json!({ "number": 21 })).await?;
        Ok(out.result)
    })
}

fn doubler() -> Workflow {
    Workflow::typed::<Doubling, i64, _, _>("doubler", |ctx, input: Doubling| async move {
        ctx.run("double", move || async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok(json!(input.number * 2))
        })
        .await
        .map(|out| out.result.as_i64().unwrap_or(0))
    })
    // A small start delay guarantees the caller's subscription write lands
    // in our record before a worker picks us up.
    .with_job_options(JobOptions {
        delay: Some(Duration::from_millis(20)),
        ..JobOptions::default()
    })
}

#[tokio::test]
async fn invoke_awaits_and_promotion_short_circuits_the_poll() {
    let h = common::start_client(vec![caller(), doubler()]).await;
    let workflow = h.client.get_workflow("caller").unwrap();
    let started = Instant::now();
    let created = workflow.create_job(json!(null), None).await.unwrap();

    // The caller parks in the delayed set while the invoked job runs.
    assert!(
        common::wait_for_phase(&h.queue, "caller", &created.job_id, JobPhase::Delayed, 1_000)
            .await,
        "caller should suspend while waiting"
    );
    let caller_state = common::job_state(&h.queue, "caller", &created.job_id).await;
    let step = &caller_state.steps["call-b"];
    assert_eq!(step.status, StepStatus::Delayed);
    let pending: PendingInvocation = serde_json::from_value(step.result.clone()).unwrap();

    // The invoked job carries the caller's subscription.
    let invoked_state = common::job_state(&h.queue, "doubler", &pending.job_id).await;
    assert_eq!(invoked_state.invocations.len(), 1);
    assert_eq!(invoked_state.invocations[0].caller_workflow_id, "caller");
    assert_eq!(invoked_state.invocations[0].caller_step_id, "call-b");

    let rv = common::wait_for_return_value(&h.queue, "caller", &created.job_id, 3_000)
        .await
        .expect("caller completes");
    assert_eq!(rv, json!(42));

    // Completion must arrive via promotion, well inside the 1s poll
    // backstop.
    assert!(
        started.elapsed() < Duration::from_millis(800),
        "caller should be promoted rather than wait-polled (took {:?})",
        started.elapsed()
    );

    // The invoked job id is written exactly once and survives completion
    // of the invoked job.
    let caller_state = common::job_state(&h.queue, "caller", &created.job_id).await;
    assert_eq!(caller_state.steps["call-b"].status, StepStatus::Completed);
    assert_eq!(caller_state.steps["call-b"].result, json!(42));
}

#[tokio::test]
async fn invoking_an_unregistered_workflow_fails_the_caller_without_retries() {
    use restep::queue::{Job, Queue};

    // A generous retry budget must not be spent on a target that can
    // never resolve.
    let wf = Workflow::raw("lost-caller", |ctx, _data| async move {
        let out = ctx.invoke("call", "nobody-home", json!(null)).await?;
        Ok(out.result)
    })
    .with_job_options(JobOptions {
        retries: Some(3),
        ..JobOptions::default()
    });

    let h = common::start_client(vec![wf]).await;
    let workflow = h.client.get_workflow("lost-caller").unwrap();
    let created = workflow.create_job(json!(null), None).await.unwrap();
    assert!(
        common::wait_for_phase(&h.queue, "lost-caller", &created.job_id, JobPhase::Failed, 2_000)
            .await,
        "caller should fail on an unknown target"
    );
    let job = h.queue.job("lost-caller", &created.job_id).await.unwrap().unwrap();
    assert_eq!(
        job.attempts_made().await.unwrap(),
        1,
        "an unknown target is terminal on the first attempt"
    );
}

#[tokio::test]
async fn invoked_failure_propagates_to_the_caller() {
    let failing = Workflow::raw("boomer", |ctx, _data| async move {
        ctx.run("explode", || async { Err::<Value, _>("denied".to_string()) })
            .await?;
        Ok(json!(null))
    });
    let caller = Workflow::raw("anxious-caller", |ctx, _data| async move {
        let out = ctx.invoke("call-boom", "boomer", json!(null)).await?;
        Ok(out.result)
    });

    // Tighten the poll backstop: failures are not promoted, so the caller
    // only notices on its next poll wake-up.
    let options = ClientOptions {
        invoke_poll_interval: Duration::from_millis(100),
        ..ClientOptions::default()
    };
    let h = common::start_client_with(vec![caller, failing], options).await;
    let workflow = h.client.get_workflow("anxious-caller").unwrap();
    let created = workflow.create_job(json!(null), None).await.unwrap();

    assert!(
        common::wait_for_phase(
            &h.queue,
            "anxious-caller",
            &created.job_id,
            JobPhase::Failed,
            3_000
        )
        .await,
        "caller should fail once the invoked job fails"
    );

    let state = common::job_state(&h.queue, "anxious-caller", &created.job_id).await;
    assert_eq!(state.steps["call-boom"].status, StepStatus::Failed);
    assert!(state
        .steps["call-boom"]
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("failed"));
    assert_eq!(state.errors.len(), 1);
    assert_eq!(state.errors[0].step_id, "call-boom");
}

#[tokio::test]
async fn invoke_workflow_binds_to_a_workflow_object() {
    use std::sync::{Arc, OnceLock};

    let target = Workflow::typed::<Doubling, i64, _, _>("bound-doubler", |_ctx, input| async move {
        Ok(input.number * 2)
    });

    // The caller resolves the target workflow object at run time (here via
    // a slot filled from the started client) and invokes through it.
    let target_slot: Arc<OnceLock<Arc<Workflow>>> = Arc::new(OnceLock::new());
    let slot = target_slot.clone();
    let caller = Workflow::raw("bound-caller", move |ctx, _data| {
        let slot = slot.clone();
        async move {
            let target = slot.get().cloned().ok_or(FlowError::NotReady)?;
            let out = ctx
                .invoke_workflow(&target, "call", json!({ "number": 4 }))
                .await?;
            Ok(out.result)
        }
    });

    let h = common::start_client(vec![caller, target]).await;
    let _ = target_slot.set(h.client.get_workflow("bound-doubler").unwrap());
    let workflow = h.client.get_workflow("bound-caller").unwrap();
    let created = workflow.create_job(json!(null), None).await.unwrap();
    let rv = common::wait_for_return_value(&h.queue, "bound-caller", &created.job_id, 3_000)
        .await
        .expect("bound caller completes");
    assert_eq!(rv, json!(8));
}
