//! In-process network of engines.
//!
//! Each member gets its own checkpoint store, bus, router and scheduler. The
//! network pumps records between them one event at a time, so scenarios run
//! deterministically against a [`ManualClock`].

use anyhow::{anyhow, bail, Context};
use chrono::Duration;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use flowline_core::{
    CheckpointStore, Clock, EngineConfig, EventProcessor, FlowEvent, FlowEventPayload, FlowEventPipeline, FlowId,
    FlowRegistry, FlowRunStatus, FlowScheduler, FlowState, JsonContinuationSerializer, MemberIdentity, MessageBus,
    Payload, PhysicalAddress, Record, RecordValue, RpcFlowResult, StartFlow, Topic,
};
use flowline_state_inmemory::{
    InMemoryCheckpointStore, InMemoryMessageBus, LoopbackSessionRouter, StaticAddressResolver,
};

use crate::clock::ManualClock;

// Upper bound on pump rounds before a scenario is declared stuck
const MAX_ROUNDS: usize = 10_000;

/// Result of an off-fiber operation, or its failure message
pub type ExternalHandler = Box<dyn Fn(&str, &Payload) -> Result<Payload, String> + Send + Sync>;

/// One member of the network
pub struct TestNode {
    /// Member identity
    pub member: MemberIdentity,
    /// Transport address
    pub address: PhysicalAddress,
    /// Checkpoints
    pub store: Arc<InMemoryCheckpointStore>,
    /// Bus
    pub bus: Arc<InMemoryMessageBus>,
    /// Session router
    pub router: LoopbackSessionRouter,
    scheduler: FlowScheduler,
    processed: Vec<FlowEvent>,
}

impl TestNode {
    /// Checkpointed state of a live flow
    pub async fn flow_state(&self, flow_id: &FlowId) -> Option<FlowState> {
        self.store
            .load(flow_id)
            .await
            .ok()
            .flatten()
            .and_then(|stored| stored.checkpoint)
            .map(|checkpoint| checkpoint.flow_state)
    }

    /// Events this node has processed, in order
    pub fn processed(&self) -> &[FlowEvent] {
        &self.processed
    }
}

/// Members wired together through their buses
pub struct TestNetwork {
    clock: Arc<ManualClock>,
    registry: FlowRegistry,
    resolver: Arc<StaticAddressResolver>,
    config: EngineConfig,
    nodes: Vec<TestNode>,
    results: HashMap<String, Vec<RpcFlowResult>>,
    dead_letters: Vec<Record>,
    external: Option<ExternalHandler>,
}

fn address_of(member: &str) -> PhysicalAddress {
    let name = member.trim_start_matches("O=").to_lowercase();
    PhysicalAddress(format!("{}:10002", name))
}

impl TestNetwork {
    /// Network of `members` sharing one flow registry
    pub fn new(registry: FlowRegistry, members: &[&str]) -> Self {
        let clock = Arc::new(ManualClock::default());
        let resolver = members.iter().fold(StaticAddressResolver::new(), |resolver, member| {
            resolver.with_member(MemberIdentity(member.to_string()), address_of(member))
        });
        let mut network = Self {
            clock,
            registry,
            resolver: Arc::new(resolver),
            config: EngineConfig::default(),
            nodes: Vec::new(),
            results: HashMap::new(),
            dead_letters: Vec::new(),
            external: None,
        };

        for member in members {
            let store = Arc::new(InMemoryCheckpointStore::new());
            let bus = Arc::new(InMemoryMessageBus::with_clock(network.clock.clone()));
            let scheduler = network.scheduler(store.clone(), bus.clone());
            network.nodes.push(TestNode {
                member: MemberIdentity(member.to_string()),
                address: address_of(member),
                store,
                bus,
                router: LoopbackSessionRouter::new(MemberIdentity(member.to_string())),
                scheduler,
                processed: Vec::new(),
            });
        }
        network
    }

    /// Answer external requests with `handler`
    pub fn with_external_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, &Payload) -> Result<Payload, String> + Send + Sync + 'static,
    {
        self.external = Some(Box::new(handler));
        self
    }

    fn scheduler(&self, store: Arc<InMemoryCheckpointStore>, bus: Arc<InMemoryMessageBus>) -> FlowScheduler {
        let pipeline = FlowEventPipeline::with_default_handlers(
            Arc::new(self.registry.clone()),
            Arc::new(JsonContinuationSerializer),
            self.resolver.clone(),
        );
        let clock: Arc<dyn Clock> = self.clock.clone();
        let processor = EventProcessor::new(pipeline, clock);
        FlowScheduler::new(processor, store, bus, &self.config)
    }

    /// The shared clock
    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    /// Node for a member
    pub fn node(&self, member: &str) -> anyhow::Result<&TestNode> {
        self.nodes
            .iter()
            .find(|node| node.member.0 == member)
            .ok_or_else(|| anyhow!("unknown member {}", member))
    }

    fn node_index(&self, member: &str) -> anyhow::Result<usize> {
        self.nodes
            .iter()
            .position(|node| node.member.0 == member)
            .ok_or_else(|| anyhow!("unknown member {}", member))
    }

    /// Ask `member` to start a flow. Returns the flow id and client request id.
    pub async fn start_flow(
        &self,
        member: &str,
        flow_type: &str,
        args: serde_json::Value,
    ) -> anyhow::Result<(FlowId, String)> {
        let node = self.node(member)?;
        let flow_id = FlowId::generate();
        let client_request_id = uuid::Uuid::new_v4().to_string();
        let event = FlowEvent::new(
            flow_id.clone(),
            FlowEventPayload::StartFlow(StartFlow {
                flow_type: flow_type.to_string(),
                args: Payload::json(args),
                client_request_id: client_request_id.clone(),
                requester: "test".to_string(),
                owner: node.member.clone(),
            }),
        );
        node.bus.publish(vec![Record::flow_event(event)]).await?;
        info!(member, flow_type, flow_id = %flow_id, "Requested flow start");
        Ok((flow_id, client_request_id))
    }

    /// Put an event straight onto a member's flow event topic
    pub async fn inject(&self, member: &str, event: FlowEvent) -> anyhow::Result<()> {
        self.node(member)?.bus.publish(vec![Record::flow_event(event)]).await?;
        Ok(())
    }

    /// Pump every bus until nothing ready is left
    pub async fn run_until_idle(&mut self) -> anyhow::Result<()> {
        for _ in 0..MAX_ROUNDS {
            if !self.pump_once().await? {
                return Ok(());
            }
        }
        bail!("network still busy after {} rounds", MAX_ROUNDS)
    }

    /// Advance the clock and pump
    pub async fn advance(&mut self, by: Duration) -> anyhow::Result<()> {
        self.clock.advance(by);
        self.run_until_idle().await
    }

    /// Process one event per node and route whatever came out.
    /// Returns whether anything moved.
    pub async fn pump_once(&mut self) -> anyhow::Result<bool> {
        let mut moved = false;

        for index in 0..self.nodes.len() {
            let node = &mut self.nodes[index];
            if let Some(record) = node.bus.try_consume(Topic::FlowEvent).await {
                if let RecordValue::FlowEvent(event) = record.value {
                    debug!(member = %node.member, flow_id = %event.flow_id, "Delivering event");
                    node.scheduler
                        .process_event(event.clone())
                        .await
                        .with_context(|| format!("processing event on {}", node.member))?;
                    node.processed.push(event);
                }
                moved = true;
            }
        }

        for index in 0..self.nodes.len() {
            moved |= self.route_outbound(index).await?;
        }
        Ok(moved)
    }

    async fn route_outbound(&mut self, index: usize) -> anyhow::Result<bool> {
        let mut moved = false;

        let frames = self.nodes[index].bus.drain(Topic::P2POut).await;
        for record in frames {
            moved = true;
            let (address, message) = match record.value {
                RecordValue::P2P { address, message } => (address, message),
                other => bail!("unexpected record on P2P topic: {:?}", other),
            };
            self.nodes[index].router.observe_outbound(&message).await;

            let recipient = match self.nodes.iter().find(|node| node.address == address) {
                Some(node) => node,
                None => bail!("no member listens on {}", address.0),
            };
            if let Some(event) = recipient.router.route(message).await {
                recipient.bus.publish(vec![Record::flow_event(event)]).await?;
            }
        }

        let statuses = self.nodes[index].bus.drain(Topic::FlowStatus).await;
        for record in statuses {
            moved = true;
            if let RecordValue::RpcFlowResult(result) = record.value {
                self.results
                    .entry(result.client_request_id.clone())
                    .or_default()
                    .push(result);
            }
        }

        let requests = self.nodes[index].bus.drain(Topic::ExternalRequest).await;
        for record in requests {
            moved = true;
            if let RecordValue::ExternalRequest {
                flow_id,
                operation_id,
                operation,
                input,
            } = record.value
            {
                let handler = self
                    .external
                    .as_ref()
                    .ok_or_else(|| anyhow!("no external handler for {}", operation))?;
                let result = handler(&operation, &input);
                let event = FlowEvent::new(flow_id, FlowEventPayload::ExternalResponse { operation_id, result });
                self.nodes[index].bus.publish(vec![Record::flow_event(event)]).await?;
            }
        }

        let dead = self.nodes[index].bus.drain(Topic::DeadLetter).await;
        moved |= !dead.is_empty();
        self.dead_letters.extend(dead);

        Ok(moved)
    }

    /// Replace a member's engine. Checkpoints and queued records survive.
    pub fn restart(&mut self, member: &str) -> anyhow::Result<()> {
        let index = self.node_index(member)?;
        let store = self.nodes[index].store.clone();
        let bus = self.nodes[index].bus.clone();
        self.nodes[index].scheduler = self.scheduler(store, bus);
        info!(member, "Restarted engine");
        Ok(())
    }

    /// Take the next event, process it without saving or publishing, put it
    /// back and restart the engine, as if the process died mid-event
    pub async fn crash_during_next_event(&mut self, member: &str) -> anyhow::Result<()> {
        let index = self.node_index(member)?;
        let node = &self.nodes[index];
        let record = node
            .bus
            .try_consume(Topic::FlowEvent)
            .await
            .ok_or_else(|| anyhow!("{} has no event to crash on", member))?;

        if let RecordValue::FlowEvent(event) = &record.value {
            let pipeline = FlowEventPipeline::with_default_handlers(
                Arc::new(self.registry.clone()),
                Arc::new(JsonContinuationSerializer),
                self.resolver.clone(),
            );
            let stored = node.store.load(&event.flow_id).await?.and_then(|s| s.checkpoint);
            // Work done here is lost with the process
            let _ = pipeline.execute(stored, event.clone(), self.clock.now());
        }

        node.bus.publish(vec![record]).await?;
        self.restart(member)
    }

    /// Take the next event, process it and save the result, then put the event
    /// back and restart the engine before anything is published. The records
    /// only survive in the store's outbox.
    pub async fn crash_after_save_during_next_event(&mut self, member: &str) -> anyhow::Result<()> {
        let index = self.node_index(member)?;
        let node = &self.nodes[index];
        let record = node
            .bus
            .try_consume(Topic::FlowEvent)
            .await
            .ok_or_else(|| anyhow!("{} has no event to crash on", member))?;

        if let RecordValue::FlowEvent(event) = &record.value {
            let pipeline = FlowEventPipeline::with_default_handlers(
                Arc::new(self.registry.clone()),
                Arc::new(JsonContinuationSerializer),
                self.resolver.clone(),
            );
            let stored = node.store.load(&event.flow_id).await?;
            let version = stored.as_ref().map(|s| s.version);
            let checkpoint = stored.and_then(|s| s.checkpoint);

            let response = pipeline.execute(checkpoint.clone(), event.clone(), self.clock.now())?;
            if response.checkpoint != checkpoint {
                node.store
                    .save(&event.flow_id, version, response.checkpoint, response.records)
                    .await?;
            }
        }

        node.bus.publish(vec![record]).await?;
        self.restart(member)
    }

    /// Deliver the last event a member processed once more
    pub async fn redeliver_last(&self, member: &str) -> anyhow::Result<FlowEvent> {
        let node = self.node(member)?;
        let event = node
            .processed
            .last()
            .cloned()
            .ok_or_else(|| anyhow!("{} has not processed anything", member))?;
        node.bus.publish(vec![Record::flow_event(event.clone())]).await?;
        Ok(event)
    }

    /// Every status published for a client request, in order
    pub fn results(&self, client_request_id: &str) -> &[RpcFlowResult] {
        self.results
            .get(client_request_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Terminal status for a client request, if the flow has finished
    pub fn final_result(&self, client_request_id: &str) -> Option<&RpcFlowResult> {
        self.results(client_request_id)
            .iter()
            .rev()
            .find(|result| result.status != FlowRunStatus::Running)
    }

    /// Dead-lettered records across all members
    pub fn dead_letters(&self) -> &[Record] {
        &self.dead_letters
    }
}
