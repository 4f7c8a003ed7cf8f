use chrono::Duration;
use pretty_assertions::assert_eq;
use serde_json::json;

use flowline_core::{FlowRunStatus, Payload};
use flowline_tests::alice_and_bob;

#[tokio::test]
async fn restart_between_events_resumes_from_checkpoint() -> anyhow::Result<()> {
    let mut network = alice_and_bob();

    let (flow_id, request) = network.start_flow("O=Alice", "Counter", json!({"steps": 3})).await?;
    network.pump_once().await?;
    network.pump_once().await?;

    let before = network.node("O=Alice")?.flow_state(&flow_id).await.unwrap();
    assert_eq!(before.suspend_count, 2);

    network.restart("O=Alice")?;
    network.run_until_idle().await?;

    let result = network.final_result(&request).unwrap();
    assert_eq!(result.status, FlowRunStatus::Completed);
    assert_eq!(result.result, Some(Payload::json(json!(3))));
    Ok(())
}

#[tokio::test]
async fn crash_mid_event_loses_nothing() -> anyhow::Result<()> {
    let mut network = alice_and_bob();

    let (flow_id, request) = network.start_flow("O=Alice", "Counter", json!({"steps": 3})).await?;
    network.pump_once().await?;
    let before = network.node("O=Alice")?.flow_state(&flow_id).await.unwrap();

    network.crash_during_next_event("O=Alice").await?;

    // Nothing from the lost attempt reached the store
    assert_eq!(network.node("O=Alice")?.flow_state(&flow_id).await, Some(before));

    network.run_until_idle().await?;
    let result = network.final_result(&request).unwrap();
    assert_eq!(result.result, Some(Payload::json(json!(3))));
    Ok(())
}

#[tokio::test]
async fn crash_while_waiting_for_peer() -> anyhow::Result<()> {
    let mut network = alice_and_bob();

    let (_, request) = network
        .start_flow("O=Alice", "Ping", json!({"peer": "O=Bob", "payload": "survive"}))
        .await?;
    network.pump_once().await?;

    network.restart("O=Alice")?;
    network.restart("O=Bob")?;
    network.run_until_idle().await?;

    let result = network.final_result(&request).unwrap();
    assert_eq!(result.result, Some(Payload::json(json!("survive"))));
    Ok(())
}

#[tokio::test]
async fn sleep_survives_restart() -> anyhow::Result<()> {
    let mut network = alice_and_bob();

    let (flow_id, request) = network.start_flow("O=Alice", "Nap", json!({"seconds": 60})).await?;
    network.run_until_idle().await?;
    assert!(network.final_result(&request).is_none());
    assert!(network.node("O=Alice")?.flow_state(&flow_id).await.is_some());

    network.restart("O=Alice")?;
    network.advance(Duration::seconds(30)).await?;
    assert!(network.final_result(&request).is_none());

    network.advance(Duration::seconds(30)).await?;
    let result = network.final_result(&request).unwrap();
    assert_eq!(result.result, Some(Payload::json(json!("rested"))));
    Ok(())
}

#[tokio::test]
async fn crash_after_save_still_publishes_frames() -> anyhow::Result<()> {
    let mut network = alice_and_bob();

    let (flow_id, request) = network
        .start_flow("O=Alice", "Ping", json!({"peer": "O=Bob", "payload": "durable"}))
        .await?;
    network.crash_after_save_during_next_event("O=Alice").await?;

    // The checkpoint moved on but its Init and Data frames never left
    let alice = network.node("O=Alice")?;
    assert!(alice.flow_state(&flow_id).await.is_some());
    assert!(!alice.store.pending_outbox(&flow_id).await.is_empty());

    // The redelivered start is a duplicate, so only the outbox can carry the frames
    network.run_until_idle().await?;

    let result = network.final_result(&request).unwrap();
    assert_eq!(result.result, Some(Payload::json(json!("durable"))));
    assert!(network.node("O=Alice")?.store.pending_outbox(&flow_id).await.is_empty());
    assert!(network.dead_letters().is_empty());
    Ok(())
}
