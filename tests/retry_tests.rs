//! Retry policies evaluated inside replay: durable backoff timers, policy
//! exhaustion, per-attempt timeouts.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use duratask::runtime::{ActivityRegistry, EntityRegistry, OrchestrationRegistry};
use duratask::{
    BackoffStrategy, Client, HistoryEvent, OrchestrationContext, OrchestrationStatus, RetryPolicy, Runtime,
};

mod common;

#[tokio::test]
async fn flaky_activity_succeeds_within_policy() {
    let backend = common::memory_backend();
    let attempts = Arc::new(AtomicU32::new(0));

    let orchestrator = |ctx: OrchestrationContext, _input: String| async move {
        let policy = RetryPolicy::new(3).with_backoff(BackoffStrategy::Fixed {
            delay: Duration::from_millis(20),
        });
        ctx.schedule_activity_with_retry("Flaky", "x", policy).await
    };
    let counter = attempts.clone();
    let activities = ActivityRegistry::builder()
        .register("Flaky", move |_ctx, _input: String| {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(format!("transient failure {n}"))
                } else {
                    Ok("finally".to_string())
                }
            }
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder().register("Retry", orchestrator).build();

    let rt = Runtime::start_with_backend(
        backend.clone(),
        activities,
        orchestrations,
        EntityRegistry::builder().build(),
    )
    .await;
    let client = Client::new(backend.clone());

    client.start_orchestration("retry-1", "Retry", "").await.unwrap();
    let status = client
        .wait_for_orchestration("retry-1", Duration::from_secs(5))
        .await
        .unwrap();
    assert!(matches!(status, OrchestrationStatus::Completed { output } if output == "finally"));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    // Two failed attempts, two backoff timers, one success.
    let history = client.get_execution_history("retry-1", 1).await;
    assert_eq!(
        history
            .iter()
            .filter(|e| matches!(e, HistoryEvent::ActivityFailed { .. }))
            .count(),
        2
    );
    assert_eq!(
        history
            .iter()
            .filter(|e| matches!(e, HistoryEvent::TimerCreated { .. }))
            .count(),
        2
    );

    rt.shutdown().await;
}

#[tokio::test]
async fn exhausted_policy_surfaces_the_last_error() {
    let backend = common::memory_backend();

    let orchestrator = |ctx: OrchestrationContext, _input: String| async move {
        let policy = RetryPolicy::new(2).with_backoff(BackoffStrategy::Fixed {
            delay: Duration::from_millis(10),
        });
        ctx.schedule_activity_with_retry("Broken", "x", policy).await
    };
    let activities = ActivityRegistry::builder()
        .register("Broken", |_ctx, _input: String| async move {
            Err::<String, _>("always down".to_string())
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder().register("Doomed", orchestrator).build();

    let rt = Runtime::start_with_backend(
        backend.clone(),
        activities,
        orchestrations,
        EntityRegistry::builder().build(),
    )
    .await;
    let client = Client::new(backend.clone());

    client.start_orchestration("retry-2", "Doomed", "").await.unwrap();
    let status = client
        .wait_for_orchestration("retry-2", Duration::from_secs(5))
        .await
        .unwrap();
    match status {
        OrchestrationStatus::Failed { error } => assert_eq!(error, "always down"),
        other => panic!("unexpected status: {other:?}"),
    }

    rt.shutdown().await;
}

#[tokio::test]
async fn per_attempt_timeout_races_activity_against_timer() {
    let backend = common::memory_backend();

    let orchestrator = |ctx: OrchestrationContext, _input: String| async move {
        let policy = RetryPolicy::new(1).with_timeout(Duration::from_millis(50));
        match ctx.schedule_activity_with_retry("Glacial", "x", policy).await {
            Ok(_) => Err("expected a timeout".to_string()),
            Err(e) => Ok(e),
        }
    };
    let activities = ActivityRegistry::builder()
        .register("Glacial", |_ctx, _input: String| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok("too late".to_string())
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder().register("Deadline", orchestrator).build();

    let rt = Runtime::start_with_backend(
        backend.clone(),
        activities,
        orchestrations,
        EntityRegistry::builder().build(),
    )
    .await;
    let client = Client::new(backend.clone());

    client.start_orchestration("retry-3", "Deadline", "").await.unwrap();
    let status = client
        .wait_for_orchestration("retry-3", Duration::from_secs(5))
        .await
        .unwrap();
    match status {
        OrchestrationStatus::Completed { output } => {
            assert!(output.contains("timeout"), "got: {output}");
        }
        other => panic!("unexpected status: {other:?}"),
    }

    rt.shutdown().await;
}
