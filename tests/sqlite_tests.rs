//! Smoke coverage for the sqlite backend: the same engine flows over a
//! transactional store with native delayed visibility.

use std::sync::Arc;
use std::time::Duration;

use duratask::backend::sqlite::SqliteBackend;
use duratask::backend::Backend;
use duratask::runtime::{ActivityRegistry, EntityRegistry, OrchestrationRegistry};
use duratask::{Client, HistoryEvent, OrchestrationContext, OrchestrationStatus, PurgeOutcome, Runtime};

mod common;

async fn sqlite_backend() -> Arc<dyn Backend> {
    Arc::new(SqliteBackend::new_in_memory("sqlite-hub").await.unwrap())
}

#[tokio::test]
async fn activity_and_timer_flow_completes_on_sqlite() {
    let backend = sqlite_backend().await;

    let orchestrator = |ctx: OrchestrationContext, input: String| async move {
        ctx.schedule_timer(30).into_timer().await;
        let doubled = ctx.schedule_activity("Double", input).into_activity().await?;
        Ok(doubled)
    };
    let activities = ActivityRegistry::builder()
        .register("Double", |_ctx, input: String| async move {
            let n: i64 = input.parse().map_err(|e| format!("{e}"))?;
            Ok((n * 2).to_string())
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder().register("SqlFlow", orchestrator).build();

    let rt = Runtime::start_with_backend(
        backend.clone(),
        activities,
        orchestrations,
        EntityRegistry::builder().build(),
    )
    .await;
    let client = Client::new(backend.clone());

    client.start_orchestration("sql-1", "SqlFlow", "8").await.unwrap();
    let status = client
        .wait_for_orchestration("sql-1", Duration::from_secs(10))
        .await
        .unwrap();
    assert!(matches!(status, OrchestrationStatus::Completed { output } if output == "16"));

    let history = client.get_execution_history("sql-1", 1).await;
    assert!(history.iter().any(|e| matches!(e, HistoryEvent::TimerFired { .. })));

    let info = client.get_instance_info("sql-1").await.unwrap();
    assert_eq!(info.status, "Completed");
    assert_eq!(info.orchestration_name, "SqlFlow");
    assert!(info.completed_at_ms.is_some());

    rt.shutdown().await;
}

#[tokio::test]
async fn disk_backed_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("hub.db");
    std::fs::File::create(&db_path).unwrap();
    let url = format!("sqlite:{}", db_path.display());

    {
        let backend: Arc<dyn Backend> = Arc::new(SqliteBackend::new(&url, "disk-hub").await.unwrap());
        let orchestrations = OrchestrationRegistry::builder()
            .register("Quick", |_ctx, input: String| async move { Ok(input) })
            .build();
        let rt = Runtime::start_with_backend(
            backend.clone(),
            ActivityRegistry::builder().build(),
            orchestrations,
            EntityRegistry::builder().build(),
        )
        .await;
        let client = Client::new(backend.clone());
        client.start_orchestration("disk-1", "Quick", "persisted").await.unwrap();
        client
            .wait_for_orchestration("disk-1", Duration::from_secs(10))
            .await
            .unwrap();
        rt.shutdown().await;
    }

    // A fresh backend over the same file sees the committed history.
    let backend: Arc<dyn Backend> = Arc::new(SqliteBackend::new(&url, "disk-hub").await.unwrap());
    let client = Client::new(backend);
    let status = client.get_orchestration_status("disk-1").await;
    assert!(matches!(status, OrchestrationStatus::Completed { output } if output == "persisted"));
    let history = client.get_execution_history("disk-1", 1).await;
    assert!(matches!(history.first(), Some(HistoryEvent::OrchestrationStarted { .. })));
}

#[tokio::test]
async fn sqlite_appends_are_conditional_and_terminal_frozen() {
    let backend = sqlite_backend().await;
    backend.create_instance("sql-race").await.unwrap();
    let started = HistoryEvent::OrchestrationStarted {
        event_id: 1,
        name: "o".into(),
        version: "1.0.0".into(),
        input: String::new(),
        started_at_ms: 0,
        parent_instance: None,
        parent_id: None,
    };
    backend.append("sql-race", 1, 0, vec![started]).await.unwrap();

    let stale = backend
        .append(
            "sql-race",
            1,
            0,
            vec![HistoryEvent::TimerCreated {
                event_id: 2,
                fire_at_ms: 1,
            }],
        )
        .await
        .unwrap_err();
    assert!(stale.is_conflict());

    backend
        .append(
            "sql-race",
            1,
            1,
            vec![HistoryEvent::OrchestrationCompleted {
                event_id: 2,
                output: "done".into(),
            }],
        )
        .await
        .unwrap();
    let frozen = backend
        .append(
            "sql-race",
            1,
            2,
            vec![HistoryEvent::TimerCreated {
                event_id: 3,
                fire_at_ms: 1,
            }],
        )
        .await
        .unwrap_err();
    assert!(!frozen.is_conflict() && !frozen.is_retryable());
}

#[tokio::test]
async fn sqlite_purge_removes_history_and_metadata() {
    let backend = sqlite_backend().await;
    let orchestrations = OrchestrationRegistry::builder()
        .register("Quick", |_ctx, input: String| async move { Ok(input) })
        .build();
    let rt = Runtime::start_with_backend(
        backend.clone(),
        ActivityRegistry::builder().build(),
        orchestrations,
        EntityRegistry::builder().build(),
    )
    .await;
    let client = Client::new(backend.clone());

    client.start_orchestration("sql-purge", "Quick", "x").await.unwrap();
    client
        .wait_for_orchestration("sql-purge", Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(client.purge_instance("sql-purge").await.unwrap(), PurgeOutcome::Purged);
    assert_eq!(
        client.get_orchestration_status("sql-purge").await,
        OrchestrationStatus::NotFound
    );
    assert!(client.get_execution_history("sql-purge", 1).await.is_empty());
    assert_eq!(client.purge_instance("sql-purge").await.unwrap(), PurgeOutcome::NotFound);

    rt.shutdown().await;
}
