use pretty_assertions::assert_eq;
use serde_json::json;

use flowline_core::{FlowError, FlowRunStatus, Payload};
use flowline_tests::alice_and_bob;

#[tokio::test]
async fn nested_failure_reaches_caller_and_counterparty() -> anyhow::Result<()> {
    let mut network = alice_and_bob();

    let (flow_id, request) = network.start_flow("O=Alice", "Outer", json!({"peer": "O=Bob"})).await?;
    network.run_until_idle().await?;

    let result = network.final_result(&request).unwrap();
    assert_eq!(result.status, FlowRunStatus::Failed);
    assert_eq!(result.error, Some(FlowError::Failed("inner failed".to_string())));

    let alice = network.node("O=Alice")?;
    assert!(alice.store.is_tombstoned(&flow_id).await);

    // The listener saw the error frame and failed too
    assert!(network.node("O=Bob")?.store.live_flows().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn caught_subflow_failure_unwinds_the_stack() -> anyhow::Result<()> {
    let mut network = alice_and_bob();

    let (flow_id, request) = network.start_flow("O=Alice", "Recovering", json!(null)).await?;

    // Pump until the flow parks on the checkpoint after the failure
    let mut depth = None;
    for _ in 0..10 {
        network.pump_once().await?;
        if let Some(state) = network.node("O=Alice")?.flow_state(&flow_id).await {
            if state.suspend_count == 2 {
                depth = Some(state.flow_stack.len());
                break;
            }
        }
    }
    assert_eq!(depth, Some(1));

    network.run_until_idle().await?;
    let result = network.final_result(&request).unwrap();
    assert_eq!(result.status, FlowRunStatus::Completed);
    assert_eq!(
        result.result,
        Some(Payload::json(json!({"recovered": "inner failed"})))
    );
    Ok(())
}
