//! Management surface: terminate, suspend/resume, purge and retention
//! sweeps.

use std::time::Duration;

use duratask::runtime::{ActivityRegistry, EntityRegistry, OrchestrationRegistry};
use duratask::{
    Client, ClientError, HistoryEvent, OrchestrationContext, OrchestrationStatus, PurgeOutcome, RetentionPolicy,
    Runtime, TerminalStatus,
};

mod common;

fn waiting_orchestrations() -> OrchestrationRegistry {
    OrchestrationRegistry::builder()
        .register("WaitForever", |ctx: OrchestrationContext, _input: String| async move {
            let data = ctx.wait_event("Go").into_event().await;
            Ok(data)
        })
        .register("Quick", |_ctx, input: String| async move { Ok(input) })
        .build()
}

#[tokio::test]
async fn terminate_short_circuits_a_running_instance() {
    let backend = common::memory_backend();
    let rt = Runtime::start_with_backend(
        backend.clone(),
        ActivityRegistry::builder().build(),
        waiting_orchestrations(),
        EntityRegistry::builder().build(),
    )
    .await;
    let client = Client::new(backend.clone());

    client.start_orchestration("term-1", "WaitForever", "").await.unwrap();
    assert!(
        common::wait_for_history(
            backend.clone(),
            "term-1",
            |h| h.iter().any(|e| matches!(e, HistoryEvent::ExternalSubscribed { .. })),
            2_000,
        )
        .await
    );

    client.terminate_instance("term-1", "operator request").await.unwrap();
    let status = client
        .wait_for_orchestration("term-1", Duration::from_secs(5))
        .await
        .unwrap();
    match status {
        OrchestrationStatus::Terminated { reason } => assert_eq!(reason, "operator request"),
        other => panic!("unexpected status: {other:?}"),
    }

    // The terminal reason is surfaced through instance metadata.
    let info = client.get_instance_info("term-1").await.unwrap();
    assert_eq!(info.status, "Terminated");
    assert_eq!(info.output.as_deref(), Some("operator request"));

    // A raise after termination is accepted by the client but discarded by
    // the runtime; the instance stays terminated.
    client.raise_event("term-1", "Go", "late").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(matches!(
        client.get_orchestration_status("term-1").await,
        OrchestrationStatus::Terminated { .. }
    ));

    rt.shutdown().await;
}

#[tokio::test]
async fn suspend_buffers_completions_until_resume() {
    let backend = common::memory_backend();
    let rt = Runtime::start_with_backend(
        backend.clone(),
        ActivityRegistry::builder().build(),
        waiting_orchestrations(),
        EntityRegistry::builder().build(),
    )
    .await;
    let client = Client::new(backend.clone());

    client.start_orchestration("susp-1", "WaitForever", "").await.unwrap();
    assert!(
        common::wait_for_history(
            backend.clone(),
            "susp-1",
            |h| h.iter().any(|e| matches!(e, HistoryEvent::ExternalSubscribed { .. })),
            2_000,
        )
        .await
    );

    client.suspend_instance("susp-1", "maintenance").await.unwrap();
    assert!(
        common::wait_until(
            || async {
                client.get_orchestration_status("susp-1").await == OrchestrationStatus::Suspended
            },
            2_000,
        )
        .await
    );

    // The event is buffered while suspended: the instance must not complete.
    client.raise_event("susp-1", "Go", "payload").await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        client.get_orchestration_status("susp-1").await,
        OrchestrationStatus::Suspended
    );

    client.resume_instance("susp-1", "maintenance done").await.unwrap();
    let status = client
        .wait_for_orchestration("susp-1", Duration::from_secs(5))
        .await
        .unwrap();
    assert!(matches!(status, OrchestrationStatus::Completed { output } if output == "payload"));

    rt.shutdown().await;
}

#[tokio::test]
async fn purge_requires_terminal_status_and_is_idempotent() {
    let backend = common::memory_backend();
    let rt = Runtime::start_with_backend(
        backend.clone(),
        ActivityRegistry::builder().build(),
        waiting_orchestrations(),
        EntityRegistry::builder().build(),
    )
    .await;
    let client = Client::new(backend.clone());

    // Unknown instance: well-defined NotFound, not an error.
    assert_eq!(client.purge_instance("never-existed").await.unwrap(), PurgeOutcome::NotFound);

    // Running instance: rejected.
    client.start_orchestration("purge-run", "WaitForever", "").await.unwrap();
    assert!(
        common::wait_until(
            || async {
                client.get_orchestration_status("purge-run").await == OrchestrationStatus::Running
            },
            2_000,
        )
        .await
    );
    let err = client.purge_instance("purge-run").await.unwrap_err();
    assert!(matches!(err, ClientError::NotTerminal { .. }));

    // Completed instance: purged, then NotFound on the second attempt.
    client.start_orchestration("purge-done", "Quick", "bye").await.unwrap();
    client
        .wait_for_orchestration("purge-done", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(client.purge_instance("purge-done").await.unwrap(), PurgeOutcome::Purged);
    assert_eq!(
        client.get_orchestration_status("purge-done").await,
        OrchestrationStatus::NotFound
    );
    assert_eq!(client.purge_instance("purge-done").await.unwrap(), PurgeOutcome::NotFound);

    rt.shutdown().await;
}

#[tokio::test]
async fn retention_rules_use_status_specific_overrides() {
    let backend = common::memory_backend();
    let rt = Runtime::start_with_backend(
        backend.clone(),
        ActivityRegistry::builder().build(),
        waiting_orchestrations(),
        EntityRegistry::builder().build(),
    )
    .await;
    let client = Client::new(backend.clone());

    // Instance A completes; instance B is terminated. Both reached their
    // terminal status moments ago.
    client.start_orchestration("ret-a", "Quick", "done").await.unwrap();
    client.wait_for_orchestration("ret-a", Duration::from_secs(5)).await.unwrap();

    client.start_orchestration("ret-b", "WaitForever", "").await.unwrap();
    assert!(
        common::wait_until(
            || async { client.get_orchestration_status("ret-b").await == OrchestrationStatus::Running },
            2_000,
        )
        .await
    );
    client.terminate_instance("ret-b", "cancelled").await.unwrap();
    client.wait_for_orchestration("ret-b", Duration::from_secs(5)).await.unwrap();

    // Completed purges immediately (0-day rule); Terminated keeps the 1-day
    // default and survives the sweep.
    let policy = RetentionPolicy::new(RetentionPolicy::days(1)).with_rule(TerminalStatus::Completed, Duration::ZERO);
    let purged = client.purge_expired(&policy).await.unwrap();
    assert_eq!(purged, vec!["ret-a".to_string()]);
    assert_eq!(client.get_orchestration_status("ret-a").await, OrchestrationStatus::NotFound);
    assert!(matches!(
        client.get_orchestration_status("ret-b").await,
        OrchestrationStatus::Terminated { .. }
    ));

    rt.shutdown().await;
}
