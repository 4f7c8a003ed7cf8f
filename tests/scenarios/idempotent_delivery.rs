use pretty_assertions::assert_eq;
use serde_json::json;

use flowline_core::{FlowEventPayload, FlowRunStatus, Payload, RecordValue};
use flowline_tests::alice_and_bob;

fn ping_args() -> serde_json::Value {
    json!({"peer": "O=Bob", "payload": {"x": 1}})
}

#[tokio::test]
async fn duplicate_start_is_ignored() -> anyhow::Result<()> {
    let mut network = alice_and_bob();

    let (_, request) = network.start_flow("O=Alice", "Ping", ping_args()).await?;
    network.pump_once().await?;

    let replayed = network.redeliver_last("O=Alice").await?;
    assert!(matches!(replayed.payload, FlowEventPayload::StartFlow(_)));
    network.run_until_idle().await?;

    let statuses: Vec<_> = network.results(&request).iter().map(|r| r.status).collect();
    assert_eq!(statuses, vec![FlowRunStatus::Running, FlowRunStatus::Completed]);
    Ok(())
}

#[tokio::test]
async fn duplicate_session_frames_are_ignored() -> anyhow::Result<()> {
    let mut network = alice_and_bob();

    let (_, request) = network.start_flow("O=Alice", "Ping", ping_args()).await?;
    network.pump_once().await?;
    network.pump_once().await?;

    // Bob's first event was the session init
    let replayed = network.redeliver_last("O=Bob").await?;
    assert!(matches!(replayed.payload, FlowEventPayload::P2PMessage(_)));
    network.run_until_idle().await?;

    let result = network.final_result(&request).unwrap();
    assert_eq!(result.status, FlowRunStatus::Completed);
    assert_eq!(result.result, Some(Payload::json(json!({"x": 1}))));
    assert_eq!(network.results(&request).len(), 2);
    assert!(network.node("O=Bob")?.store.live_flows().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn events_after_completion_are_dead_lettered() -> anyhow::Result<()> {
    let mut network = alice_and_bob();

    let (flow_id, request) = network.start_flow("O=Alice", "Counter", json!({"steps": 1})).await?;
    network.run_until_idle().await?;
    let dead_before = network.dead_letters().len();

    let replayed = network.redeliver_last("O=Alice").await?;
    assert_eq!(replayed.flow_id, flow_id);
    network.run_until_idle().await?;

    assert_eq!(network.results(&request).len(), 2);
    let dead = &network.dead_letters()[dead_before..];
    assert_eq!(dead.len(), 1);
    match &dead[0].value {
        RecordValue::DeadLetter { event, .. } => assert_eq!(event.flow_id, flow_id),
        other => panic!("unexpected dead letter {:?}", other),
    }
    Ok(())
}
