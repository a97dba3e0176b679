//! Durable entities end to end: signals from the client, calls from
//! orchestrations, per-key state isolation.

use std::time::Duration;

use duratask::runtime::{ActivityRegistry, EntityRegistry, OrchestrationRegistry};
use duratask::{Client, EntityContext, EntityId, OrchestrationContext, OrchestrationStatus, Runtime};

mod common;

fn counter_entities() -> EntityRegistry {
    EntityRegistry::builder()
        .register("Counter", |ctx: EntityContext, op: String, input: String| async move {
            let current: i64 = ctx.state().map(|s| s.parse().unwrap_or(0)).unwrap_or(0);
            match op.as_str() {
                "add" => {
                    let n = current + input.parse::<i64>().map_err(|e| e.to_string())?;
                    ctx.set_state(n.to_string());
                    Ok(n.to_string())
                }
                "get" => Ok(current.to_string()),
                "reset" => {
                    ctx.delete_state();
                    Ok(String::new())
                }
                other => Err(format!("unknown operation: {other}")),
            }
        })
        .build()
}

#[tokio::test]
async fn client_signals_apply_sequentially_per_key() {
    let backend = common::memory_backend();
    let rt = Runtime::start_with_backend(
        backend.clone(),
        ActivityRegistry::builder().build(),
        OrchestrationRegistry::builder().build(),
        counter_entities(),
    )
    .await;
    let client = Client::new(backend.clone());

    let counter = EntityId::new("Counter", "tickets");
    for _ in 0..10 {
        client.signal_entity(counter.clone(), "add", "1").await.unwrap();
    }

    assert!(
        common::wait_until(
            || async { client.read_entity_state(&counter).await.as_deref() == Some("10") },
            5_000,
        )
        .await,
        "ten increments must fold into state 10, got {:?}",
        client.read_entity_state(&counter).await
    );

    // A different key is untouched.
    assert_eq!(client.read_entity_state(&EntityId::new("Counter", "other")).await, None);

    rt.shutdown().await;
}

#[tokio::test]
async fn orchestration_calls_receive_entity_results() {
    let backend = common::memory_backend();

    let orchestrator = |ctx: OrchestrationContext, input: String| async move {
        let counter = EntityId::new("Counter", input);
        let first = ctx.call_entity(counter.clone(), "add", "5").into_entity().await?;
        let second = ctx.call_entity(counter.clone(), "add", "7").into_entity().await?;
        let read = ctx.call_entity(counter, "get", "").into_entity().await?;
        Ok(format!("{first},{second},{read}"))
    };
    let orchestrations = OrchestrationRegistry::builder().register("CountTwice", orchestrator).build();

    let rt = Runtime::start_with_backend(
        backend.clone(),
        ActivityRegistry::builder().build(),
        orchestrations,
        counter_entities(),
    )
    .await;
    let client = Client::new(backend.clone());

    client.start_orchestration("ent-call-1", "CountTwice", "orders").await.unwrap();
    let status = client
        .wait_for_orchestration("ent-call-1", Duration::from_secs(5))
        .await
        .unwrap();
    match status {
        OrchestrationStatus::Completed { output } => assert_eq!(output, "5,12,12"),
        other => panic!("unexpected status: {other:?}"),
    }
    assert_eq!(
        client.read_entity_state(&EntityId::new("Counter", "orders")).await.as_deref(),
        Some("12")
    );

    rt.shutdown().await;
}

#[tokio::test]
async fn failed_operations_leave_state_untouched() {
    let backend = common::memory_backend();

    let orchestrator = |ctx: OrchestrationContext, _input: String| async move {
        let counter = EntityId::new("Counter", "audited");
        ctx.call_entity(counter.clone(), "add", "3").into_entity().await?;
        // Unknown op fails, but must not disturb committed state.
        let err = ctx
            .call_entity(counter.clone(), "explode", "")
            .into_entity()
            .await
            .unwrap_err();
        let read = ctx.call_entity(counter, "get", "").into_entity().await?;
        Ok(format!("{err}|{read}"))
    };
    let orchestrations = OrchestrationRegistry::builder().register("Audit", orchestrator).build();

    let rt = Runtime::start_with_backend(
        backend.clone(),
        ActivityRegistry::builder().build(),
        orchestrations,
        counter_entities(),
    )
    .await;
    let client = Client::new(backend.clone());

    client.start_orchestration("ent-fail-1", "Audit", "").await.unwrap();
    let status = client
        .wait_for_orchestration("ent-fail-1", Duration::from_secs(5))
        .await
        .unwrap();
    match status {
        OrchestrationStatus::Completed { output } => {
            assert_eq!(output, "unknown operation: explode|3");
        }
        other => panic!("unexpected status: {other:?}"),
    }

    rt.shutdown().await;
}

#[tokio::test]
async fn signals_to_unregistered_entities_are_logged_not_fatal() {
    let backend = common::memory_backend();
    let rt = Runtime::start_with_backend(
        backend.clone(),
        ActivityRegistry::builder().build(),
        OrchestrationRegistry::builder().build(),
        EntityRegistry::builder().build(),
    )
    .await;
    let client = Client::new(backend.clone());

    let ghost = EntityId::new("Ghost", "k");
    client.signal_entity(ghost.clone(), "noop", "").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.read_entity_state(&ghost).await, None);

    rt.shutdown().await;
}
