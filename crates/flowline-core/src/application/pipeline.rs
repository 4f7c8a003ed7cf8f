//! Event pipeline.
//!
//! One inbound event moves a flow from its stored checkpoint to a new
//! checkpoint plus the records to publish. The stages run in a fixed order,
//! each taking and returning the [`FlowEventContext`].

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::continuation::{Continuation, ContinuationSerializer};
use super::fiber::{run_fiber, FiberOutcome};
use super::handlers;
use super::registry::FlowFactory;
use super::requests::post_process_request;
use super::teardown;
use crate::domain::checkpoint::{Checkpoint, SuspendedOn};
use crate::domain::events::{FlowEvent, FlowEventKind, FlowEventPayload};
use crate::domain::identity::FlowId;
use crate::domain::records::Record;
use crate::domain::repository::AddressResolver;
use crate::error::{CoreError, FlowError};

/// What the fiber should do with the current event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunDecision {
    /// Resume or start the flow
    Run,
    /// Resume the parked request with an error
    Error(FlowError),
    /// Leave the flow parked
    Continue,
}

/// Working state threaded through the pipeline stages
#[derive(Debug)]
pub struct FlowEventContext {
    /// Flow the event is addressed to
    pub flow_id: FlowId,

    /// Inbound event
    pub event: FlowEvent,

    /// Working copy of the checkpoint, `None` when absent or tombstoned
    pub checkpoint: Option<Checkpoint>,

    /// Records to publish
    pub records: Vec<Record>,

    /// Time the event is processed at
    pub now: DateTime<Utc>,

    /// Handler's run decision
    pub decision: RunDecision,

    /// How the fiber run ended, if it ran
    pub fiber_outcome: Option<FiberOutcome>,

    /// Journal after the fiber run
    pub journal: Option<Continuation>,

    /// Flow finished during this event
    pub terminated: bool,
}

impl FlowEventContext {
    fn new(checkpoint: Option<Checkpoint>, event: FlowEvent, now: DateTime<Utc>) -> Self {
        Self {
            flow_id: event.flow_id.clone(),
            event,
            checkpoint,
            records: Vec::new(),
            now,
            decision: RunDecision::Continue,
            fiber_outcome: None,
            journal: None,
            terminated: false,
        }
    }

    /// Checkpoint for mutation, or `FlowNotFound`
    pub fn require_checkpoint(&mut self) -> Result<&mut Checkpoint, CoreError> {
        let flow_id = &self.flow_id;
        self.checkpoint
            .as_mut()
            .ok_or_else(|| CoreError::FlowNotFound(flow_id.0.clone()))
    }
}

/// Final output of the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowEventResponse {
    /// Checkpoint to store, `None` to tombstone or leave absent
    pub checkpoint: Option<Checkpoint>,

    /// Records to publish
    pub records: Vec<Record>,
}

/// Per-event-kind behaviour plugged into the pipeline
pub trait FlowEventHandler: Send + Sync {
    /// Event kind handled
    fn kind(&self) -> FlowEventKind;

    /// Validate the event and fold it into the working checkpoint
    fn preprocess(&self, ctx: FlowEventContext) -> Result<FlowEventContext, CoreError>;

    /// Decide whether the fiber should run
    fn run_or_continue(&self, ctx: &FlowEventContext) -> RunDecision;

    /// Side effects after the fiber ran
    fn postprocess(&self, ctx: FlowEventContext) -> Result<FlowEventContext, CoreError> {
        Ok(ctx)
    }
}

/// Sequential pipeline driving one flow per event
pub struct FlowEventPipeline {
    handlers: HashMap<FlowEventKind, Box<dyn FlowEventHandler>>,
    factory: Arc<dyn FlowFactory>,
    serializer: Arc<dyn ContinuationSerializer>,
    resolver: Arc<dyn AddressResolver>,
}

impl FlowEventPipeline {
    /// Pipeline with an explicit handler table
    pub fn new(
        handlers: Vec<Box<dyn FlowEventHandler>>,
        factory: Arc<dyn FlowFactory>,
        serializer: Arc<dyn ContinuationSerializer>,
        resolver: Arc<dyn AddressResolver>,
    ) -> Self {
        let handlers = handlers.into_iter().map(|h| (h.kind(), h)).collect();
        Self {
            handlers,
            factory,
            serializer,
            resolver,
        }
    }

    /// Pipeline with a handler for every event kind
    pub fn with_default_handlers(
        factory: Arc<dyn FlowFactory>,
        serializer: Arc<dyn ContinuationSerializer>,
        resolver: Arc<dyn AddressResolver>,
    ) -> Self {
        let handlers = handlers::default_handlers(factory.clone(), resolver.clone());
        Self::new(handlers, factory, serializer, resolver)
    }

    /// Run every stage for one event
    pub fn execute(
        &self,
        checkpoint: Option<Checkpoint>,
        event: FlowEvent,
        now: DateTime<Utc>,
    ) -> Result<FlowEventResponse, CoreError> {
        let ctx = self.start(checkpoint, event, now)?;
        let ctx = self.pre_process(ctx)?;
        let ctx = self.run_or_continue(ctx)?;
        let ctx = self.set_checkpoint_suspended_on(ctx)?;
        let ctx = self.request_post_processing(ctx)?;
        let ctx = self.event_post_processing(ctx)?;
        Ok(self.to_response(ctx))
    }

    fn handler(&self, kind: FlowEventKind) -> Result<&dyn FlowEventHandler, CoreError> {
        self.handlers
            .get(&kind)
            .map(|h| h.as_ref())
            .ok_or_else(|| CoreError::ConfigurationError(format!("No handler registered for {:?} events", kind)))
    }

    /// Stage 1: build the context and make sure a handler exists
    pub fn start(
        &self,
        checkpoint: Option<Checkpoint>,
        event: FlowEvent,
        now: DateTime<Utc>,
    ) -> Result<FlowEventContext, CoreError> {
        self.handler(event.kind())?;
        debug!(flow_id = %event.flow_id, kind = event.kind().event_type(), "Processing event");
        Ok(FlowEventContext::new(checkpoint, event, now))
    }

    /// Stage 2: handler preprocessing, then teardown of killed flows
    pub fn pre_process(&self, ctx: FlowEventContext) -> Result<FlowEventContext, CoreError> {
        let mut ctx = self.handler(ctx.event.kind())?.preprocess(ctx)?;

        let killed = ctx
            .checkpoint
            .as_ref()
            .map(|c| c.flow_state.is_killed)
            .unwrap_or(false);
        if killed {
            let reason = match &ctx.event.payload {
                FlowEventPayload::Kill { reason } => reason.clone(),
                _ => "flow was killed".to_string(),
            };
            teardown::kill(&mut ctx, self.resolver.as_ref(), reason)?;
        }
        Ok(ctx)
    }

    /// Stage 3: run the fiber if the handler says so
    pub fn run_or_continue(&self, mut ctx: FlowEventContext) -> Result<FlowEventContext, CoreError> {
        if ctx.terminated {
            return Ok(ctx);
        }

        ctx.decision = self.handler(ctx.event.kind())?.run_or_continue(&ctx);
        let injected = match &ctx.decision {
            RunDecision::Continue => {
                debug!(flow_id = %ctx.flow_id, "Flow stays parked");
                return Ok(ctx);
            }
            RunDecision::Run => None,
            RunDecision::Error(err) => Some(err.clone()),
        };

        let flow_id = ctx.flow_id.clone();
        let now = ctx.now;
        let checkpoint = ctx.require_checkpoint()?;
        let flow = self
            .factory
            .create(&checkpoint.flow_state.flow_type, &checkpoint.flow_state.start_args)?;
        let journal = self
            .serializer
            .restore(checkpoint.serialized_continuation.as_deref())?;

        let run = run_fiber(
            flow.as_ref(),
            flow_id,
            checkpoint.flow_state.clone(),
            journal,
            now,
            injected,
        )?;
        checkpoint.flow_state = run.state;

        match run.outcome {
            FiberOutcome::Completed(result) => {
                teardown::complete(&mut ctx, self.resolver.as_ref(), result)?;
            }
            FiberOutcome::Failed(error) => {
                teardown::fail(&mut ctx, self.resolver.as_ref(), error)?;
            }
            outcome @ FiberOutcome::Suspended { .. } => {
                ctx.fiber_outcome = Some(outcome);
                ctx.journal = Some(run.journal);
            }
        }
        Ok(ctx)
    }

    /// Stage 4: record the parked request and the journal on the checkpoint
    pub fn set_checkpoint_suspended_on(&self, mut ctx: FlowEventContext) -> Result<FlowEventContext, CoreError> {
        let (request, resume_index, fresh) = match &ctx.fiber_outcome {
            Some(FiberOutcome::Suspended {
                request,
                resume_index,
                fresh,
            }) => (request.clone(), *resume_index, *fresh),
            _ => return Ok(ctx),
        };

        let bytes = match &ctx.journal {
            Some(journal) => Some(self.serializer.serialize(journal)?),
            None => None,
        };
        let flow_id = ctx.flow_id.clone();
        let checkpoint = ctx.require_checkpoint()?;
        let state = &mut checkpoint.flow_state;

        if fresh {
            state.suspend_count += 1;
            state.clear_pending_wakeups();
            info!(flow_id = %flow_id, request = ?request.kind(), suspend_count = state.suspend_count, "Flow suspended");
        }
        state.suspended_on = Some(SuspendedOn { request, resume_index });
        if bytes.is_some() {
            checkpoint.serialized_continuation = bytes;
        }
        Ok(ctx)
    }

    /// Stage 5: translate a freshly parked request into records
    pub fn request_post_processing(&self, mut ctx: FlowEventContext) -> Result<FlowEventContext, CoreError> {
        let request = match &ctx.fiber_outcome {
            Some(FiberOutcome::Suspended {
                request, fresh: true, ..
            }) => request.clone(),
            _ => return Ok(ctx),
        };

        let flow_id = ctx.flow_id.clone();
        let now = ctx.now;
        let resolver = self.resolver.clone();
        let checkpoint = ctx.require_checkpoint()?;
        let records = post_process_request(resolver.as_ref(), &flow_id, &mut checkpoint.flow_state, &request, now)?;
        ctx.records.extend(records);
        Ok(ctx)
    }

    /// Stage 6: handler postprocessing
    pub fn event_post_processing(&self, ctx: FlowEventContext) -> Result<FlowEventContext, CoreError> {
        self.handler(ctx.event.kind())?.postprocess(ctx)
    }

    /// Stage 7: final checkpoint and records
    pub fn to_response(&self, ctx: FlowEventContext) -> FlowEventResponse {
        FlowEventResponse {
            checkpoint: ctx.checkpoint,
            records: ctx.records,
        }
    }
}
