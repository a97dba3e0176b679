//! External event delivery, including the buffering guarantee: an event
//! raised before the orchestration reaches its wait must still be observed.

use std::time::Duration;

use duratask::runtime::{ActivityRegistry, EntityRegistry, OrchestrationRegistry};
use duratask::{Client, DurableOutput, HistoryEvent, OrchestrationContext, OrchestrationStatus, Runtime};

mod common;

#[tokio::test]
async fn wait_then_raise_delivers_payload() {
    let backend = common::memory_backend();

    let orchestrator = |ctx: OrchestrationContext, _input: String| async move {
        let decision = ctx.wait_event("Approved").into_event().await;
        Ok(format!("approved:{decision}"))
    };
    let orchestrations = OrchestrationRegistry::builder().register("Approval", orchestrator).build();

    let rt = Runtime::start_with_backend(
        backend.clone(),
        ActivityRegistry::builder().build(),
        orchestrations,
        EntityRegistry::builder().build(),
    )
    .await;
    let client = Client::new(backend.clone());

    client.start_orchestration("appr-1", "Approval", "").await.unwrap();
    // Wait for the subscription checkpoint before raising.
    assert!(
        common::wait_for_history(
            backend.clone(),
            "appr-1",
            |h| h.iter().any(|e| matches!(e, HistoryEvent::ExternalSubscribed { .. })),
            2_000,
        )
        .await
    );
    client.raise_event("appr-1", "Approved", "{\"approved\":true}").await.unwrap();

    let status = client
        .wait_for_orchestration("appr-1", Duration::from_secs(5))
        .await
        .unwrap();
    assert!(matches!(status, OrchestrationStatus::Completed { output } if output == "approved:{\"approved\":true}"));

    rt.shutdown().await;
}

#[tokio::test]
async fn event_raised_before_the_wait_is_buffered() {
    let backend = common::memory_backend();

    // The orchestration dawdles on a timer before subscribing; the raise
    // lands in history first and must still satisfy the wait.
    let orchestrator = |ctx: OrchestrationContext, _input: String| async move {
        ctx.schedule_timer(150).into_timer().await;
        let data = ctx.wait_event("Approved").into_event().await;
        Ok(data)
    };
    let orchestrations = OrchestrationRegistry::builder().register("SlowSubscriber", orchestrator).build();

    let rt = Runtime::start_with_backend(
        backend.clone(),
        ActivityRegistry::builder().build(),
        orchestrations,
        EntityRegistry::builder().build(),
    )
    .await;
    let client = Client::new(backend.clone());

    client.start_orchestration("buf-1", "SlowSubscriber", "").await.unwrap();
    client.raise_event("buf-1", "Approved", "early-bird").await.unwrap();

    let status = client
        .wait_for_orchestration("buf-1", Duration::from_secs(5))
        .await
        .unwrap();
    assert!(matches!(status, OrchestrationStatus::Completed { output } if output == "early-bird"));

    // The raise is recorded ahead of the subscription in history.
    let history = client.get_execution_history("buf-1", 1).await;
    let raised_at = history
        .iter()
        .position(|e| matches!(e, HistoryEvent::ExternalRaised { .. }))
        .unwrap();
    let subscribed_at = history
        .iter()
        .position(|e| matches!(e, HistoryEvent::ExternalSubscribed { .. }))
        .unwrap();
    assert!(raised_at < subscribed_at, "raise should be buffered before the wait");

    rt.shutdown().await;
}

#[tokio::test]
async fn approval_race_against_timeout_timer() {
    let backend = common::memory_backend();

    let orchestrator = |ctx: OrchestrationContext, _input: String| async move {
        let approval = ctx.wait_event("Approved");
        let deadline = ctx.schedule_timer(10_000);
        match ctx.select(vec![approval, deadline]).await {
            (0, DurableOutput::External(data)) => Ok(format!("approved:{data}")),
            (1, DurableOutput::Timer) => Ok("timed-out".to_string()),
            other => Err(format!("unexpected winner: {other:?}")),
        }
    };
    let orchestrations = OrchestrationRegistry::builder().register("Gated", orchestrator).build();

    let rt = Runtime::start_with_backend(
        backend.clone(),
        ActivityRegistry::builder().build(),
        orchestrations,
        EntityRegistry::builder().build(),
    )
    .await;
    let client = Client::new(backend.clone());

    client.start_orchestration("gate-1", "Gated", "").await.unwrap();
    assert!(
        common::wait_for_history(
            backend.clone(),
            "gate-1",
            |h| h.iter().any(|e| matches!(e, HistoryEvent::ExternalSubscribed { .. })),
            2_000,
        )
        .await
    );
    client.raise_event("gate-1", "Approved", "yes").await.unwrap();

    let status = client
        .wait_for_orchestration("gate-1", Duration::from_secs(5))
        .await
        .unwrap();
    assert!(matches!(status, OrchestrationStatus::Completed { output } if output == "approved:yes"));

    rt.shutdown().await;
}

#[tokio::test]
async fn raise_on_unknown_instance_is_a_client_error() {
    let backend = common::memory_backend();
    let client = Client::new(backend.clone());
    let err = client.raise_event("missing", "Approved", "x").await.unwrap_err();
    assert!(matches!(err, duratask::ClientError::NotFound(_)));
}
