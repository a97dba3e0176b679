//! Continue-as-new: fresh history per execution for the same instance id.

use std::time::Duration;

use duratask::runtime::{ActivityRegistry, EntityRegistry, OrchestrationRegistry};
use duratask::{Client, HistoryEvent, OrchestrationContext, OrchestrationStatus, Runtime};

mod common;

#[tokio::test]
async fn counter_loop_restarts_until_done() {
    let backend = common::memory_backend();

    let orchestrator = |ctx: OrchestrationContext, input: String| async move {
        let round: u64 = input.parse().unwrap_or(0);
        if round >= 3 {
            return Ok(format!("done:{round}"));
        }
        ctx.continue_as_new((round + 1).to_string()).await;
        unreachable!("continue_as_new never resolves")
    };
    let orchestrations = OrchestrationRegistry::builder().register("Looper", orchestrator).build();

    let rt = Runtime::start_with_backend(
        backend.clone(),
        ActivityRegistry::builder().build(),
        orchestrations,
        EntityRegistry::builder().build(),
    )
    .await;
    let client = Client::new(backend.clone());

    client.start_orchestration("loop-1", "Looper", "0").await.unwrap();
    let status = client
        .wait_for_orchestration("loop-1", Duration::from_secs(5))
        .await
        .unwrap();
    match status {
        OrchestrationStatus::Completed { output } => assert_eq!(output, "done:3"),
        other => panic!("unexpected status: {other:?}"),
    }

    // Four executions: the initial one plus three restarts.
    assert_eq!(backend.latest_execution_id("loop-1").await, Some(4));

    // Each closed execution ends with the continue-as-new marker, and the
    // final one keeps only its own fresh history.
    let first = client.get_execution_history("loop-1", 1).await;
    assert!(matches!(
        first.last(),
        Some(HistoryEvent::OrchestrationContinuedAsNew { .. })
    ));
    let last = client.get_execution_history("loop-1", 4).await;
    assert!(matches!(last.first(), Some(HistoryEvent::OrchestrationStarted { .. })));
    assert!(matches!(
        last.last(),
        Some(HistoryEvent::OrchestrationCompleted { .. })
    ));

    rt.shutdown().await;
}

#[tokio::test]
async fn work_can_run_between_restarts() {
    let backend = common::memory_backend();

    let orchestrator = |ctx: OrchestrationContext, input: String| async move {
        let round: u64 = input.parse().unwrap_or(0);
        let doubled = ctx.schedule_activity("Double", round.to_string()).into_activity().await?;
        if round >= 2 {
            return Ok(doubled);
        }
        ctx.continue_as_new((round + 1).to_string()).await;
        unreachable!()
    };
    let activities = ActivityRegistry::builder()
        .register("Double", |_ctx, input: String| async move {
            let n: u64 = input.parse().map_err(|e| format!("{e}"))?;
            Ok((n * 2).to_string())
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder().register("StepLoop", orchestrator).build();

    let rt = Runtime::start_with_backend(
        backend.clone(),
        activities,
        orchestrations,
        EntityRegistry::builder().build(),
    )
    .await;
    let client = Client::new(backend.clone());

    client.start_orchestration("steps-1", "StepLoop", "0").await.unwrap();
    let status = client
        .wait_for_orchestration("steps-1", Duration::from_secs(5))
        .await
        .unwrap();
    assert!(matches!(status, OrchestrationStatus::Completed { output } if output == "4"));
    assert_eq!(backend.latest_execution_id("steps-1").await, Some(3));

    rt.shutdown().await;
}
