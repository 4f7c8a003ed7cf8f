//! Flow scheduler.
//!
//! Consumes the flow-event topic and feeds events to the processor, strictly
//! one at a time per flow id. Each flow id with queued events gets a worker
//! task that drains its queue; a semaphore bounds how many flows are
//! processed at once.
//!
//! Records are written to the checkpoint's outbox in the same store write as
//! the checkpoint, published, then acknowledged by clearing the outbox. An
//! outbox left behind by a crash is published before the flow's next event.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

use super::processor::{EventProcessor, ProcessingStatus};
use crate::config::EngineConfig;
use crate::domain::checkpoint::Checkpoint;
use crate::domain::events::FlowEvent;
use crate::domain::identity::FlowId;
use crate::domain::records::{Record, RecordValue, Topic};
use crate::domain::repository::{CheckpointStore, MessageBus, StoredCheckpoint};
use crate::error::CoreError;

struct SchedulerCore {
    processor: EventProcessor,
    store: Arc<dyn CheckpointStore>,
    bus: Arc<dyn MessageBus>,
    max_save_retries: u32,
}

impl SchedulerCore {
    /// Process an event, dead-lettering it on any non-fatal error
    async fn handle(&self, event: FlowEvent) -> Result<(), CoreError> {
        match self.process(event.clone()).await {
            Err(e) if !e.is_fatal() => {
                error!(flow_id = %event.flow_id, "Event processing failed: {}", e);
                self.bus
                    .publish(vec![Record::dead_letter(event, e.to_string())])
                    .await
            }
            other => other,
        }
    }

    /// Publish records a previous run stored but did not acknowledge, and
    /// clear them from the store
    async fn flush_outbox(&self, flow_id: &FlowId, stored: StoredCheckpoint) -> Result<StoredCheckpoint, CoreError> {
        if stored.outbox.is_empty() {
            return Ok(stored);
        }
        warn!(flow_id = %flow_id, records = stored.outbox.len(), "Publishing unacknowledged outbox");
        self.bus.publish(stored.outbox).await?;
        let version = self
            .store
            .save(flow_id, Some(stored.version), stored.checkpoint.clone(), Vec::new())
            .await?;
        Ok(StoredCheckpoint {
            version,
            checkpoint: stored.checkpoint,
            outbox: Vec::new(),
        })
    }

    async fn acknowledge(&self, flow_id: &FlowId, version: u64, checkpoint: Option<Checkpoint>) -> Result<(), CoreError> {
        match self.store.save(flow_id, Some(version), checkpoint, Vec::new()).await {
            Ok(_) => Ok(()),
            Err(CoreError::VersionConflict { .. }) => {
                warn!(flow_id = %flow_id, "Checkpoint changed before the outbox was acknowledged");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn process(&self, event: FlowEvent) -> Result<(), CoreError> {
        let flow_id = event.flow_id.clone();
        let mut conflicts = 0;

        loop {
            let (version, checkpoint) = match self.store.load(&flow_id).await? {
                Some(stored) => {
                    let stored = self.flush_outbox(&flow_id, stored).await?;
                    (Some(stored.version), stored.checkpoint)
                }
                None => (None, None),
            };

            if version.is_some() && checkpoint.is_none() {
                warn!(flow_id = %flow_id, kind = event.kind().event_type(), "Event for finished flow");
                return self
                    .bus
                    .publish(vec![Record::dead_letter(event, "flow has finished")])
                    .await;
            }

            let response = self.processor.on_next(checkpoint.clone(), event.clone())?;
            if let ProcessingStatus::Dropped { reason } = response.status {
                return self.bus.publish(vec![Record::dead_letter(event, reason)]).await;
            }

            // An unchanged checkpoint regenerates the same records on redelivery
            if response.checkpoint == checkpoint {
                return self.bus.publish(response.records).await;
            }

            let records = response.records;
            let saved = self
                .store
                .save(&flow_id, version, response.checkpoint.clone(), records.clone())
                .await;
            let new_version = match saved {
                Ok(new_version) => new_version,
                Err(CoreError::VersionConflict { .. }) if conflicts < self.max_save_retries => {
                    conflicts += 1;
                    warn!(flow_id = %flow_id, conflicts, "Checkpoint changed underneath, reprocessing");
                    continue;
                }
                Err(e) => return Err(e),
            };
            debug!(flow_id = %flow_id, new_version, records = records.len(), "Checkpoint saved");

            if records.is_empty() {
                return Ok(());
            }
            self.bus.publish(records).await?;
            return self.acknowledge(&flow_id, new_version, response.checkpoint).await;
        }
    }
}

/// Per-flow sequential event scheduler
pub struct FlowScheduler {
    core: Arc<SchedulerCore>,
    permits: Arc<Semaphore>,
    workers: Arc<DashMap<FlowId, mpsc::UnboundedSender<FlowEvent>>>,
}

impl FlowScheduler {
    /// Create a scheduler
    pub fn new(
        processor: EventProcessor,
        store: Arc<dyn CheckpointStore>,
        bus: Arc<dyn MessageBus>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            core: Arc::new(SchedulerCore {
                processor,
                store,
                bus,
                max_save_retries: config.max_save_retries,
            }),
            permits: Arc::new(Semaphore::new(config.worker_pool_size.max(1))),
            workers: Arc::new(DashMap::new()),
        }
    }

    /// Load, process, save and publish one event.
    ///
    /// The checkpoint and its records are saved before any record is
    /// published. Events that fail with a non-fatal error are dead-lettered;
    /// fatal errors are returned.
    pub async fn process_event(&self, event: FlowEvent) -> Result<(), CoreError> {
        self.core.handle(event).await
    }

    /// Number of flows with a live worker
    pub fn active_workers(&self) -> usize {
        self.workers.len()
    }

    /// Consume flow events until the bus closes.
    ///
    /// Returns early with the error when an event fails fatally, or when the
    /// bus cannot take a dead letter.
    pub async fn run(&self) -> Result<(), CoreError> {
        info!("Flow scheduler started");
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel::<CoreError>();

        loop {
            tokio::select! {
                Some(err) = fatal_rx.recv() => {
                    error!("Flow scheduler stopping: {}", err);
                    return Err(err);
                }
                next = self.core.bus.consume(Topic::FlowEvent) => {
                    match next? {
                        Some(record) => self.dispatch(record, &fatal_tx),
                        None => break,
                    }
                }
            }
        }

        while !self.workers.is_empty() {
            if let Ok(err) = fatal_rx.try_recv() {
                return Err(err);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        if let Ok(err) = fatal_rx.try_recv() {
            return Err(err);
        }

        info!("Flow scheduler stopped");
        Ok(())
    }

    fn dispatch(&self, record: Record, fatal_tx: &mpsc::UnboundedSender<CoreError>) {
        let event = match record.value {
            RecordValue::FlowEvent(event) => event,
            other => {
                warn!(key = %record.key, "Ignoring non-event record on flow event topic: {:?}", other);
                return;
            }
        };

        match self.workers.entry(event.flow_id.clone()) {
            Entry::Occupied(mut entry) => {
                if let Err(mpsc::error::SendError(event)) = entry.get().send(event) {
                    let tx = self.spawn_worker(event.flow_id.clone(), fatal_tx.clone());
                    if tx.send(event).is_ok() {
                        entry.insert(tx);
                    }
                }
            }
            Entry::Vacant(entry) => {
                let tx = self.spawn_worker(event.flow_id.clone(), fatal_tx.clone());
                if tx.send(event).is_ok() {
                    entry.insert(tx);
                }
            }
        }
    }

    fn spawn_worker(&self, flow_id: FlowId, fatal_tx: mpsc::UnboundedSender<CoreError>) -> mpsc::UnboundedSender<FlowEvent> {
        let (tx, mut rx) = mpsc::unbounded_channel::<FlowEvent>();
        let core = self.core.clone();
        let permits = self.permits.clone();
        let workers = self.workers.clone();

        tokio::spawn(async move {
            loop {
                match rx.try_recv() {
                    Ok(event) => {
                        let permit = match permits.acquire().await {
                            Ok(permit) => permit,
                            Err(_) => {
                                workers.remove(&flow_id);
                                return;
                            }
                        };
                        let result = AssertUnwindSafe(core.handle(event))
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|panic| {
                                Err(CoreError::from_panic(&format!("Worker for flow {}", flow_id), panic))
                            });
                        drop(permit);

                        if let Err(e) = result {
                            let _ = fatal_tx.send(e);
                            workers.remove(&flow_id);
                            return;
                        }
                    }
                    Err(_) => {
                        if workers.remove_if(&flow_id, |_, _| rx.is_empty()).is_some() {
                            return;
                        }
                    }
                }
            }
        });

        tx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::continuation::JsonContinuationSerializer;
    use crate::application::fiber::{FlowContext, FlowLogic};
    use crate::application::pipeline::FlowEventPipeline;
    use crate::application::registry::FlowRegistry;
    use crate::domain::events::{FlowEventPayload, StartFlow};
    use crate::domain::identity::{MemberIdentity, PhysicalAddress};
    use crate::domain::records::{FlowRunStatus, RpcFlowResult};
    use crate::domain::repository::AddressResolver;
    use crate::error::FlowError;
    use crate::types::{Payload, SystemClock};
    use async_trait::async_trait;
    use mockall::mock;
    use mockall::predicate::*;
    use mockall::Sequence;
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    mock! {
        pub Store {}

        #[async_trait]
        impl CheckpointStore for Store {
            async fn load(&self, flow_id: &FlowId) -> Result<Option<StoredCheckpoint>, CoreError>;
            async fn save(
                &self,
                flow_id: &FlowId,
                expected_version: Option<u64>,
                checkpoint: Option<Checkpoint>,
                outbox: Vec<Record>,
            ) -> Result<u64, CoreError>;
        }
    }

    /// Bus that hands out queued flow events and reports closed once empty
    #[derive(Default)]
    struct RecordingBus {
        inbound: Mutex<VecDeque<Record>>,
        published: Mutex<Vec<Record>>,
    }

    impl RecordingBus {
        fn with_events(events: Vec<FlowEvent>) -> Self {
            Self {
                inbound: Mutex::new(events.into_iter().map(Record::flow_event).collect()),
                published: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MessageBus for RecordingBus {
        async fn publish(&self, records: Vec<Record>) -> Result<(), CoreError> {
            self.published.lock().await.extend(records);
            Ok(())
        }

        async fn consume(&self, _topic: Topic) -> Result<Option<Record>, CoreError> {
            Ok(self.inbound.lock().await.pop_front())
        }
    }

    struct LocalResolver;

    impl AddressResolver for LocalResolver {
        fn resolve(&self, member: &MemberIdentity) -> Result<PhysicalAddress, CoreError> {
            Ok(PhysicalAddress(member.0.clone()))
        }
    }

    struct CheckpointingFlow;

    #[async_trait]
    impl FlowLogic for CheckpointingFlow {
        fn flow_type(&self) -> &str {
            "Checkpointing"
        }

        async fn call(&self, ctx: &mut FlowContext) -> Result<Payload, FlowError> {
            ctx.checkpoint().await?;
            Ok(Payload::empty())
        }
    }

    struct BoomFlow;

    #[async_trait]
    impl FlowLogic for BoomFlow {
        fn flow_type(&self) -> &str {
            "Boom"
        }

        async fn call(&self, _ctx: &mut FlowContext) -> Result<Payload, FlowError> {
            panic!("boom");
        }
    }

    fn scheduler(store: MockStore, bus: Arc<RecordingBus>) -> FlowScheduler {
        let registry = FlowRegistry::new()
            .register("Checkpointing", |_: &Payload| {
                Ok(Arc::new(CheckpointingFlow) as Arc<dyn FlowLogic>)
            })
            .register("Boom", |_: &Payload| Ok(Arc::new(BoomFlow) as Arc<dyn FlowLogic>));
        let pipeline = FlowEventPipeline::with_default_handlers(
            Arc::new(registry),
            Arc::new(JsonContinuationSerializer),
            Arc::new(LocalResolver),
        );
        let processor = EventProcessor::new(pipeline, Arc::new(SystemClock));
        FlowScheduler::new(processor, Arc::new(store), bus, &EngineConfig::default())
    }

    fn start_event(flow_type: &str) -> FlowEvent {
        FlowEvent::new(
            FlowId("f1".to_string()),
            FlowEventPayload::StartFlow(StartFlow {
                flow_type: flow_type.to_string(),
                args: Payload::empty(),
                client_request_id: "req-1".to_string(),
                requester: "admin".to_string(),
                owner: MemberIdentity("O=Alice".to_string()),
            }),
        )
    }

    fn conflict(flow_id: &FlowId) -> CoreError {
        CoreError::VersionConflict {
            flow_id: flow_id.0.clone(),
            expected: None,
            actual: Some(7),
        }
    }

    fn dead_letter_reason(record: &Record) -> Option<&str> {
        match &record.value {
            RecordValue::DeadLetter { reason, .. } => Some(reason.as_str()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_saves_records_with_checkpoint_then_acknowledges() {
        let mut store = MockStore::new();
        let mut seq = Sequence::new();
        store.expect_load().times(1).returning(|_| Ok(None));
        store
            .expect_save()
            .with(eq(FlowId("f1".to_string())), eq(None), always(), always())
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, checkpoint, outbox| {
                assert!(checkpoint.is_some());
                assert_eq!(outbox.len(), 2);
                Ok(1)
            });
        store
            .expect_save()
            .with(eq(FlowId("f1".to_string())), eq(Some(1)), always(), eq(Vec::<Record>::new()))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Ok(2));

        let bus = Arc::new(RecordingBus::default());
        scheduler(store, bus.clone())
            .process_event(start_event("Checkpointing"))
            .await
            .unwrap();

        let published = bus.published.lock().await;
        assert!(published.iter().any(|r| r.topic == Topic::FlowEvent));
        assert!(published.iter().any(|r| r.topic == Topic::FlowStatus));
    }

    #[tokio::test]
    async fn test_retries_on_version_conflict() {
        let mut store = MockStore::new();
        store.expect_load().times(3).returning(|_| Ok(None));
        let mut attempts = 0;
        store.expect_save().times(4).returning(move |flow_id, _, _, _| {
            attempts += 1;
            if attempts < 3 {
                Err(conflict(flow_id))
            } else {
                Ok(attempts - 2)
            }
        });

        let bus = Arc::new(RecordingBus::default());
        scheduler(store, bus.clone())
            .process_event(start_event("Checkpointing"))
            .await
            .unwrap();

        let published = bus.published.lock().await;
        assert!(!published.is_empty());
        assert!(published.iter().all(|r| r.topic != Topic::DeadLetter));
    }

    #[tokio::test]
    async fn test_dead_letters_after_max_conflicts() {
        let mut store = MockStore::new();
        store.expect_load().returning(|_| Ok(None));
        store
            .expect_save()
            .times(4)
            .returning(|flow_id, _, _, _| Err(conflict(flow_id)));

        let bus = Arc::new(RecordingBus::default());
        scheduler(store, bus.clone())
            .process_event(start_event("Checkpointing"))
            .await
            .unwrap();

        let published = bus.published.lock().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, Topic::DeadLetter);
        assert!(dead_letter_reason(&published[0]).unwrap().contains("version conflict"));
    }

    #[tokio::test]
    async fn test_unknown_flow_type_skips_save() {
        let mut store = MockStore::new();
        store.expect_load().times(1).returning(|_| Ok(None));
        store.expect_save().never();

        let bus = Arc::new(RecordingBus::default());
        scheduler(store, bus.clone())
            .process_event(start_event("Nope"))
            .await
            .unwrap();

        let published = bus.published.lock().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, Topic::FlowStatus);
    }

    #[tokio::test]
    async fn test_event_for_finished_flow_is_dead_lettered() {
        let mut store = MockStore::new();
        store.expect_load().times(1).returning(|_| {
            Ok(Some(StoredCheckpoint {
                version: 4,
                checkpoint: None,
                outbox: Vec::new(),
            }))
        });
        store.expect_save().never();

        let bus = Arc::new(RecordingBus::default());
        scheduler(store, bus.clone())
            .process_event(FlowEvent::wakeup(FlowId("f1".to_string())))
            .await
            .unwrap();

        let published = bus.published.lock().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, Topic::DeadLetter);
    }

    #[tokio::test]
    async fn test_unacknowledged_outbox_is_published_first() {
        let flow_id = FlowId("f1".to_string());
        let leftover = Record::rpc_result(RpcFlowResult {
            client_request_id: "req-1".to_string(),
            flow_id: flow_id.clone(),
            status: FlowRunStatus::Completed,
            result: Some(Payload::empty()),
            error: None,
        });

        let mut store = MockStore::new();
        let stored_outbox = vec![leftover.clone()];
        store.expect_load().times(1).returning(move |_| {
            Ok(Some(StoredCheckpoint {
                version: 3,
                checkpoint: None,
                outbox: stored_outbox.clone(),
            }))
        });
        store
            .expect_save()
            .with(eq(flow_id.clone()), eq(Some(3)), eq(None), eq(Vec::<Record>::new()))
            .times(1)
            .returning(|_, _, _, _| Ok(4));

        let bus = Arc::new(RecordingBus::default());
        scheduler(store, bus.clone())
            .process_event(FlowEvent::wakeup(flow_id))
            .await
            .unwrap();

        let published = bus.published.lock().await;
        assert_eq!(published.len(), 2);
        assert_eq!(published[0], leftover);
        assert_eq!(published[1].topic, Topic::DeadLetter);
    }

    #[tokio::test]
    async fn test_store_failure_is_dead_lettered() {
        let mut store = MockStore::new();
        store
            .expect_load()
            .returning(|_| Err(CoreError::CheckpointStoreError("disk on fire".to_string())));

        let bus = Arc::new(RecordingBus::default());
        scheduler(store, bus.clone())
            .process_event(start_event("Checkpointing"))
            .await
            .unwrap();

        let published = bus.published.lock().await;
        assert_eq!(published.len(), 1);
        assert!(dead_letter_reason(&published[0]).unwrap().contains("disk on fire"));
    }

    #[tokio::test]
    async fn test_panicking_flow_stops_run() {
        let mut store = MockStore::new();
        store.expect_load().returning(|_| Ok(None));
        store.expect_save().never();

        let bus = Arc::new(RecordingBus::with_events(vec![start_event("Boom")]));
        let scheduler = scheduler(store, bus.clone());

        let result = tokio::time::timeout(Duration::from_secs(5), scheduler.run())
            .await
            .expect("run returned");

        match result {
            Err(CoreError::Fatal(message)) => assert!(message.contains("boom")),
            other => panic!("expected a fatal error, got {:?}", other),
        }
        assert_eq!(scheduler.active_workers(), 0);
        assert!(bus.published.lock().await.is_empty());
    }

    struct ExplodingStore;

    #[async_trait]
    impl CheckpointStore for ExplodingStore {
        async fn load(&self, _flow_id: &FlowId) -> Result<Option<StoredCheckpoint>, CoreError> {
            panic!("store exploded");
        }

        async fn save(
            &self,
            _flow_id: &FlowId,
            _expected_version: Option<u64>,
            _checkpoint: Option<Checkpoint>,
            _outbox: Vec<Record>,
        ) -> Result<u64, CoreError> {
            Ok(1)
        }
    }

    #[tokio::test]
    async fn test_panicking_store_stops_run() {
        let bus = Arc::new(RecordingBus::with_events(vec![FlowEvent::wakeup(FlowId("f1".to_string()))]));
        let pipeline = FlowEventPipeline::with_default_handlers(
            Arc::new(FlowRegistry::new()),
            Arc::new(JsonContinuationSerializer),
            Arc::new(LocalResolver),
        );
        let processor = EventProcessor::new(pipeline, Arc::new(SystemClock));
        let scheduler = FlowScheduler::new(processor, Arc::new(ExplodingStore), bus, &EngineConfig::default());

        let result = tokio::time::timeout(Duration::from_secs(5), scheduler.run())
            .await
            .expect("run returned");

        assert!(matches!(result, Err(CoreError::Fatal(message)) if message.contains("store exploded")));
        assert_eq!(scheduler.active_workers(), 0);
    }
}
