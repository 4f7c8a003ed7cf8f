use pretty_assertions::assert_eq;
use serde_json::json;

use flowline_core::{FlowEventPayload, FlowRunStatus, Payload};
use flowline_tests::alice_and_bob;

#[tokio::test]
async fn ping_pong_round_trip() -> anyhow::Result<()> {
    let mut network = alice_and_bob();

    let (_, request) = network
        .start_flow("O=Alice", "Ping", json!({"peer": "O=Bob", "payload": {"x": 1}}))
        .await?;
    network.run_until_idle().await?;

    let statuses: Vec<_> = network.results(&request).iter().map(|r| r.status).collect();
    assert_eq!(statuses, vec![FlowRunStatus::Running, FlowRunStatus::Completed]);

    let result = network.final_result(&request).unwrap();
    assert_eq!(result.result, Some(Payload::json(json!({"x": 1}))));

    assert!(network.node("O=Alice")?.store.live_flows().await.is_empty());
    assert!(network.node("O=Bob")?.store.live_flows().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn greeter_waits_for_confirmation() -> anyhow::Result<()> {
    let mut network = alice_and_bob();

    let (_, request) = network
        .start_flow("O=Alice", "Greeter", json!({"peer": "O=Bob"}))
        .await?;
    network.run_until_idle().await?;

    let result = network.final_result(&request).unwrap();
    assert_eq!(result.status, FlowRunStatus::Completed);
    assert_eq!(
        result.result.as_ref().unwrap().to_json()?,
        json!({"counterparty": "O=Bob", "reply": "hello"})
    );
    Ok(())
}

#[tokio::test]
async fn send_without_reply_needs_only_wakeups() -> anyhow::Result<()> {
    let mut network = alice_and_bob();

    let (flow_id, request) = network
        .start_flow("O=Alice", "SendTwice", json!({"peer": "O=Bob"}))
        .await?;
    network.run_until_idle().await?;

    let result = network.final_result(&request).unwrap();
    assert_eq!(result.status, FlowRunStatus::Completed);

    // Start, then one wakeup per send; nothing from Bob was needed
    let alice = network.node("O=Alice")?;
    let own: Vec<_> = alice
        .processed()
        .iter()
        .filter(|e| e.flow_id == flow_id)
        .take(3)
        .map(|e| e.kind())
        .collect();
    assert!(matches!(
        alice.processed()[0].payload,
        FlowEventPayload::StartFlow(_)
    ));
    assert_eq!(
        own[1..].iter().map(|k| k.event_type()).collect::<Vec<_>>(),
        vec!["flow.wakeup", "flow.wakeup"]
    );

    // Bob received both payloads in order and finished
    assert!(network.node("O=Bob")?.store.live_flows().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn unknown_peer_drops_start() -> anyhow::Result<()> {
    let mut network = alice_and_bob();

    let (flow_id, request) = network
        .start_flow("O=Alice", "Ping", json!({"peer": "O=Carol", "payload": 1}))
        .await?;
    network.run_until_idle().await?;

    // Address resolution failed, so nothing was saved or reported
    assert!(network.final_result(&request).is_none());
    assert!(network.node("O=Alice")?.flow_state(&flow_id).await.is_none());
    assert_eq!(network.dead_letters().len(), 1);
    Ok(())
}

#[tokio::test]
async fn external_operation_round_trip() -> anyhow::Result<()> {
    let mut network = alice_and_bob().with_external_handler(|operation, input| {
        assert_eq!(operation, "double");
        let value = input.to_json().map_err(|e| e.to_string())?;
        let n = value.as_i64().ok_or("not a number")?;
        Ok(Payload::json(json!(n * 2)))
    });

    let (_, request) = network.start_flow("O=Alice", "AsyncDouble", json!(21)).await?;
    network.run_until_idle().await?;

    let result = network.final_result(&request).unwrap();
    assert_eq!(result.result, Some(Payload::json(json!(42))));
    Ok(())
}

#[tokio::test]
async fn external_operation_failure_fails_flow() -> anyhow::Result<()> {
    let mut network = alice_and_bob().with_external_handler(|_, _| Err("executor offline".to_string()));

    let (_, request) = network.start_flow("O=Alice", "AsyncDouble", json!(21)).await?;
    network.run_until_idle().await?;

    let result = network.final_result(&request).unwrap();
    assert_eq!(result.status, FlowRunStatus::Failed);
    assert!(result.error.as_ref().unwrap().to_string().contains("executor offline"));
    Ok(())
}
