use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flowline_core::{
    Checkpoint, CheckpointStore, CoreError, EngineConfig, EventProcessor, FlowContext, FlowError, FlowEvent,
    FlowEventPayload, FlowEventPipeline, FlowId, FlowLogic, FlowRunStatus, FlowScheduler, JsonContinuationSerializer,
    MemberIdentity, MessageBus, Payload, Record, RecordValue, StartFlow, StoredCheckpoint, SystemClock, Topic,
};
use flowline_state_inmemory::{InMemoryCheckpointStore, InMemoryMessageBus, StaticAddressResolver};
use flowline_tests::{init_test_logging, sample_registry};

/// Panics as soon as it runs
struct ExplodingFlow;

#[async_trait]
impl FlowLogic for ExplodingFlow {
    fn flow_type(&self) -> &str {
        "Exploding"
    }

    async fn call(&self, _ctx: &mut FlowContext) -> Result<Payload, FlowError> {
        panic!("reactor breach")
    }
}

/// Store wrapper that tracks how many calls are in flight per flow, and
/// how many writes lost a compare-and-swap race
struct OverlapStore {
    inner: InMemoryCheckpointStore,
    in_flight: Mutex<HashMap<FlowId, usize>>,
    max_overlap: AtomicUsize,
    conflicts: AtomicUsize,
}

impl OverlapStore {
    fn new() -> Self {
        Self {
            inner: InMemoryCheckpointStore::new(),
            in_flight: Mutex::new(HashMap::new()),
            max_overlap: AtomicUsize::new(0),
            conflicts: AtomicUsize::new(0),
        }
    }

    fn enter(&self, flow_id: &FlowId) {
        let mut in_flight = self.in_flight.lock().unwrap();
        let count = in_flight.entry(flow_id.clone()).or_default();
        *count += 1;
        self.max_overlap.fetch_max(*count, Ordering::SeqCst);
    }

    fn exit(&self, flow_id: &FlowId) {
        if let Some(count) = self.in_flight.lock().unwrap().get_mut(flow_id) {
            *count -= 1;
        }
    }
}

#[async_trait]
impl CheckpointStore for OverlapStore {
    async fn load(&self, flow_id: &FlowId) -> Result<Option<StoredCheckpoint>, CoreError> {
        self.enter(flow_id);
        tokio::time::sleep(Duration::from_millis(1)).await;
        let result = self.inner.load(flow_id).await;
        self.exit(flow_id);
        result
    }

    async fn save(
        &self,
        flow_id: &FlowId,
        expected_version: Option<u64>,
        checkpoint: Option<Checkpoint>,
        outbox: Vec<Record>,
    ) -> Result<u64, CoreError> {
        self.enter(flow_id);
        tokio::time::sleep(Duration::from_millis(1)).await;
        let result = self.inner.save(flow_id, expected_version, checkpoint, outbox).await;
        if matches!(result, Err(CoreError::VersionConflict { .. })) {
            self.conflicts.fetch_add(1, Ordering::SeqCst);
        }
        self.exit(flow_id);
        result
    }
}

fn start_counter(flow_id: &FlowId, steps: u32) -> Record {
    Record::flow_event(FlowEvent::new(
        flow_id.clone(),
        FlowEventPayload::StartFlow(StartFlow {
            flow_type: "Counter".to_string(),
            args: Payload::json(json!({ "steps": steps })),
            client_request_id: flow_id.0.clone(),
            requester: "test".to_string(),
            owner: MemberIdentity("O=Alice".to_string()),
        }),
    ))
}

fn scheduler(
    pipeline: FlowEventPipeline,
    store: Arc<dyn CheckpointStore>,
    bus: Arc<InMemoryMessageBus>,
    workers: usize,
) -> FlowScheduler {
    let config = EngineConfig {
        worker_pool_size: workers,
        ..EngineConfig::default()
    };
    FlowScheduler::new(EventProcessor::new(pipeline, Arc::new(SystemClock)), store, bus, &config)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_flows_all_complete() -> anyhow::Result<()> {
    init_test_logging();
    let store = Arc::new(InMemoryCheckpointStore::new());
    let bus = Arc::new(InMemoryMessageBus::new());
    let pipeline = FlowEventPipeline::with_default_handlers(
        Arc::new(sample_registry()),
        Arc::new(JsonContinuationSerializer),
        Arc::new(StaticAddressResolver::new()),
    );
    let scheduler = Arc::new(scheduler(pipeline, store.clone(), bus.clone(), 4));

    let flows: Vec<FlowId> = (0..20).map(|i| FlowId(format!("counter-{}", i))).collect();
    bus.publish(flows.iter().map(|id| start_counter(id, 5)).collect()).await?;

    let runner = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run().await })
    };

    let mut completed = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), async {
        while completed.len() < flows.len() {
            match bus.consume(Topic::FlowStatus).await {
                Ok(Some(Record {
                    value: RecordValue::RpcFlowResult(result),
                    ..
                })) if result.status == FlowRunStatus::Completed => completed.push(result),
                Ok(Some(_)) => {}
                other => panic!("status topic ended early: {:?}", other),
            }
        }
    })
    .await?;

    bus.close().await;
    runner.await??;

    for flow_id in &flows {
        assert!(store.is_tombstoned(flow_id).await, "{} did not finish", flow_id);
    }
    for result in &completed {
        assert_eq!(result.result, Some(Payload::json(json!(5))));
    }
    assert_eq!(bus.queued(Topic::DeadLetter).await, 0);
    Ok(())
}

#[tokio::test]
async fn missing_handler_stops_scheduler() -> anyhow::Result<()> {
    init_test_logging();
    let store = Arc::new(InMemoryCheckpointStore::new());
    let bus = Arc::new(InMemoryMessageBus::new());
    let pipeline = FlowEventPipeline::new(
        Vec::new(),
        Arc::new(sample_registry()),
        Arc::new(JsonContinuationSerializer),
        Arc::new(StaticAddressResolver::new()),
    );
    let scheduler = scheduler(pipeline, store, bus.clone(), 2);

    bus.publish(vec![start_counter(&FlowId("f1".to_string()), 1)]).await?;

    let result = tokio::time::timeout(Duration::from_secs(10), scheduler.run()).await?;

    assert!(matches!(result, Err(CoreError::ConfigurationError(_))));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_flow_is_never_processed_concurrently() -> anyhow::Result<()> {
    init_test_logging();
    let store = Arc::new(OverlapStore::new());
    let bus = Arc::new(InMemoryMessageBus::new());
    let pipeline = FlowEventPipeline::with_default_handlers(
        Arc::new(sample_registry()),
        Arc::new(JsonContinuationSerializer),
        Arc::new(StaticAddressResolver::new()),
    );
    let scheduler = Arc::new(scheduler(pipeline, store.clone(), bus.clone(), 8));

    let flow_id = FlowId("hot-flow".to_string());
    let mut records = vec![start_counter(&flow_id, 10)];
    records.extend((0..50).map(|_| Record::flow_event(FlowEvent::wakeup(flow_id.clone()))));
    bus.publish(records).await?;

    let runner = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run().await })
    };

    let result = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match bus.consume(Topic::FlowStatus).await {
                Ok(Some(Record {
                    value: RecordValue::RpcFlowResult(result),
                    ..
                })) if result.status == FlowRunStatus::Completed => return result,
                Ok(Some(_)) => {}
                other => panic!("status topic ended early: {:?}", other),
            }
        }
    })
    .await?;

    // Let the leftover wakeups drain before closing the bus
    tokio::time::timeout(Duration::from_secs(10), async {
        while bus.queued(Topic::FlowEvent).await > 0 || scheduler.active_workers() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;
    bus.close().await;
    runner.await??;

    assert_eq!(result.result, Some(Payload::json(json!(10))));
    assert!(store.inner.is_tombstoned(&flow_id).await);
    assert_eq!(store.max_overlap.load(Ordering::SeqCst), 1);
    assert_eq!(store.conflicts.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn panicking_flow_stops_scheduler() -> anyhow::Result<()> {
    init_test_logging();
    let store = Arc::new(InMemoryCheckpointStore::new());
    let bus = Arc::new(InMemoryMessageBus::new());
    let registry = sample_registry().register("Exploding", |_: &Payload| {
        Ok(Arc::new(ExplodingFlow) as Arc<dyn FlowLogic>)
    });
    let pipeline = FlowEventPipeline::with_default_handlers(
        Arc::new(registry),
        Arc::new(JsonContinuationSerializer),
        Arc::new(StaticAddressResolver::new()),
    );
    let scheduler = scheduler(pipeline, store.clone(), bus.clone(), 2);

    let flow_id = FlowId("exploding".to_string());
    bus.publish(vec![Record::flow_event(FlowEvent::new(
        flow_id.clone(),
        FlowEventPayload::StartFlow(StartFlow {
            flow_type: "Exploding".to_string(),
            args: Payload::empty(),
            client_request_id: "req-boom".to_string(),
            requester: "test".to_string(),
            owner: MemberIdentity("O=Alice".to_string()),
        }),
    ))])
    .await?;

    // The bus stays open, so only the fatal error can end the run
    let result = tokio::time::timeout(Duration::from_secs(10), scheduler.run()).await?;

    match result {
        Err(CoreError::Fatal(message)) => assert!(message.contains("reactor breach"), "{}", message),
        other => panic!("expected a fatal error, got {:?}", other),
    }
    assert_eq!(scheduler.active_workers(), 0);
    assert!(store.load(&flow_id).await?.is_none());
    Ok(())
}
