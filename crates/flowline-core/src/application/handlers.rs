//! Event handlers, one per [`FlowEventKind`].

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::pipeline::{FlowEventContext, FlowEventHandler, RunDecision};
use super::registry::FlowFactory;
use crate::domain::checkpoint::{Checkpoint, FlowState, PendingEvent};
use crate::domain::events::{FlowEventKind, FlowEventPayload, P2PMessage, SessionPayload, StartFlow};
use crate::domain::identity::{FlowId, FlowIdentity, SessionId};
use crate::domain::io_request::IoRequest;
use crate::domain::records::{FlowRunStatus, Record, RpcFlowResult};
use crate::domain::repository::AddressResolver;
use crate::domain::session::{SessionState, SessionStatus};
use crate::error::{CoreError, FlowError};
use crate::types::Payload;

/// Handler table covering every event kind
pub fn default_handlers(
    factory: Arc<dyn FlowFactory>,
    resolver: Arc<dyn AddressResolver>,
) -> Vec<Box<dyn FlowEventHandler>> {
    vec![
        Box::new(StartFlowHandler::new(factory.clone())),
        Box::new(WakeupHandler),
        Box::new(SessionEventHandler::new(factory, resolver)),
        Box::new(RemoteFlowErrorHandler),
        Box::new(ExternalResponseHandler),
        Box::new(KillHandler),
    ]
}

/// How far past the next expected sequence number a frame may be buffered
pub const MAX_FRAMES_AHEAD: u64 = 1024;

/// Buffer a sequenced frame until the flow reads it. Duplicates and frames on
/// sessions this flow has closed are dropped.
fn buffer_frame(
    state: &mut FlowState,
    flow_id: &FlowId,
    session_id: SessionId,
    sequence_number: u64,
    payload: SessionPayload,
) -> Result<(), CoreError> {
    let buffered = state.has_buffered_frame(&session_id, sequence_number);
    let session = state
        .session_mut(&session_id)
        .ok_or_else(|| CoreError::InvalidEvent(format!("Unknown session {} for flow {}", session_id, flow_id)))?;

    if session.status == SessionStatus::Closed {
        warn!(
            flow_id = %flow_id,
            %session_id,
            sequence_number,
            "Dropping {} frame for closed session",
            payload.name()
        );
        return Ok(());
    }
    if session.is_duplicate(sequence_number) || buffered {
        warn!(
            flow_id = %flow_id,
            %session_id,
            sequence_number,
            "Dropping duplicate {} frame",
            payload.name()
        );
        return Ok(());
    }
    if sequence_number >= session.inbound_next_sequence_number + MAX_FRAMES_AHEAD {
        return Err(CoreError::InvalidEvent(format!(
            "Frame {} on session {} is more than {} ahead of {}",
            sequence_number, session_id, MAX_FRAMES_AHEAD, session.inbound_next_sequence_number
        )));
    }
    if let SessionPayload::Data(_) = payload {
        session.confirm();
    }

    state.pending_events.push(PendingEvent::SessionFrame {
        session_id,
        sequence_number,
        payload,
    });
    Ok(())
}

/// Run when the flow has never run, or its parked request is now satisfiable
fn run_if_satisfiable(ctx: &FlowEventContext) -> RunDecision {
    let checkpoint = match &ctx.checkpoint {
        Some(checkpoint) => checkpoint,
        None => return RunDecision::Continue,
    };
    let state = &checkpoint.flow_state;
    if state.is_killed {
        return RunDecision::Continue;
    }

    match &state.suspended_on {
        None if checkpoint.serialized_continuation.is_none() => RunDecision::Run,
        Some(suspended_on) if suspended_on.request.can_satisfy(state, ctx.now) => RunDecision::Run,
        _ => RunDecision::Continue,
    }
}

fn event_mismatch(kind: FlowEventKind) -> CoreError {
    CoreError::InvalidEvent(format!("{:?} handler received a different event", kind))
}

/// Starts RPC flows
pub struct StartFlowHandler {
    factory: Arc<dyn FlowFactory>,
}

impl StartFlowHandler {
    /// Create the handler
    pub fn new(factory: Arc<dyn FlowFactory>) -> Self {
        Self { factory }
    }
}

impl FlowEventHandler for StartFlowHandler {
    fn kind(&self) -> FlowEventKind {
        FlowEventKind::StartFlow
    }

    fn preprocess(&self, mut ctx: FlowEventContext) -> Result<FlowEventContext, CoreError> {
        let start: StartFlow = match &ctx.event.payload {
            FlowEventPayload::StartFlow(start) => start.clone(),
            _ => return Err(event_mismatch(self.kind())),
        };

        if ctx.checkpoint.is_some() {
            debug!(flow_id = %ctx.flow_id, "Duplicate start ignored");
            return Ok(ctx);
        }

        if let Err(e) = self.factory.create(&start.flow_type, &start.args) {
            warn!(flow_id = %ctx.flow_id, flow_type = %start.flow_type, "Cannot start flow: {}", e);
            ctx.records.push(Record::rpc_result(RpcFlowResult {
                client_request_id: start.client_request_id,
                flow_id: ctx.flow_id.clone(),
                status: FlowRunStatus::Failed,
                result: None,
                error: Some(FlowError::Failed(e.to_string())),
            }));
            return Ok(ctx);
        }

        info!(flow_id = %ctx.flow_id, flow_type = %start.flow_type, "Starting flow");
        let identity = FlowIdentity::new(ctx.flow_id.clone(), Some(start.client_request_id.clone()));
        let state = FlowState::for_rpc(
            start.flow_type,
            start.args,
            start.owner,
            start.client_request_id,
            start.requester,
        );
        ctx.checkpoint = Some(Checkpoint::new(identity, state));
        Ok(ctx)
    }

    fn run_or_continue(&self, ctx: &FlowEventContext) -> RunDecision {
        run_if_satisfiable(ctx)
    }

    fn postprocess(&self, mut ctx: FlowEventContext) -> Result<FlowEventContext, CoreError> {
        if ctx.decision != RunDecision::Run || ctx.terminated {
            return Ok(ctx);
        }
        let client_request_id = ctx
            .checkpoint
            .as_ref()
            .and_then(|c| c.flow_state.client_request_id().map(str::to_string));

        if let Some(client_request_id) = client_request_id {
            ctx.records.push(Record::rpc_result(RpcFlowResult {
                client_request_id,
                flow_id: ctx.flow_id.clone(),
                status: FlowRunStatus::Running,
                result: None,
                error: None,
            }));
        }
        Ok(ctx)
    }
}

/// Resumes flows parked on a checkpoint, send, close or sleep
pub struct WakeupHandler;

impl FlowEventHandler for WakeupHandler {
    fn kind(&self) -> FlowEventKind {
        FlowEventKind::Wakeup
    }

    fn preprocess(&self, mut ctx: FlowEventContext) -> Result<FlowEventContext, CoreError> {
        let state = &mut ctx.require_checkpoint()?.flow_state;

        let accepts = state
            .suspended_on
            .as_ref()
            .map(|s| s.request.accepts_wakeup())
            .unwrap_or(false);

        if accepts && !state.has_pending_wakeup() {
            state.pending_events.push(PendingEvent::Wakeup);
        }
        Ok(ctx)
    }

    fn run_or_continue(&self, ctx: &FlowEventContext) -> RunDecision {
        run_if_satisfiable(ctx)
    }
}

/// Applies inbound session frames, starting responder flows on Init
pub struct SessionEventHandler {
    factory: Arc<dyn FlowFactory>,
    resolver: Arc<dyn AddressResolver>,
}

impl SessionEventHandler {
    /// Create the handler
    pub fn new(factory: Arc<dyn FlowFactory>, resolver: Arc<dyn AddressResolver>) -> Self {
        Self { factory, resolver }
    }

    fn reply(&self, message: &P2PMessage, ctx: &FlowEventContext, payload: SessionPayload) -> Result<Record, CoreError> {
        let address = self.resolver.resolve(&message.sender)?;
        Ok(Record::p2p(
            address,
            P2PMessage {
                flow_id: ctx.flow_id.clone(),
                initiating_flow: message.initiating_flow.clone(),
                sender: message.recipient.clone(),
                recipient: message.sender.clone(),
                session_id: message.session_id.counterpart(),
                sequence_number: 0,
                payload,
            },
        ))
    }

    fn start_responder(&self, mut ctx: FlowEventContext, message: P2PMessage) -> Result<FlowEventContext, CoreError> {
        let responder = self
            .factory
            .responder_for(&message.initiating_flow)
            .filter(|flow_type| self.factory.create(flow_type, &Payload::empty()).is_ok());

        let flow_type = match responder {
            Some(flow_type) => flow_type,
            None => {
                warn!(
                    flow_id = %ctx.flow_id,
                    protocol = %message.initiating_flow,
                    "No responder registered, rejecting session"
                );
                let error = SessionPayload::Error {
                    message: format!("No responder registered for protocol {}", message.initiating_flow),
                };
                let record = self.reply(&message, &ctx, error)?;
                ctx.records.push(record);
                return Ok(ctx);
            }
        };

        info!(
            flow_id = %ctx.flow_id,
            flow_type = %flow_type,
            session_id = %message.session_id,
            "Starting responder flow"
        );
        let confirm = self.reply(&message, &ctx, SessionPayload::Confirm)?;
        let session = SessionState::responded(
            message.session_id.clone(),
            message.sender.clone(),
            message.initiating_flow.clone(),
        );
        let state = FlowState::for_initiated(flow_type, message.recipient.clone(), session);
        ctx.checkpoint = Some(Checkpoint::new(FlowIdentity::new(ctx.flow_id.clone(), None), state));
        ctx.records.push(confirm);
        Ok(ctx)
    }
}

impl FlowEventHandler for SessionEventHandler {
    fn kind(&self) -> FlowEventKind {
        FlowEventKind::SessionEvent
    }

    fn preprocess(&self, mut ctx: FlowEventContext) -> Result<FlowEventContext, CoreError> {
        let message = match &ctx.event.payload {
            FlowEventPayload::P2PMessage(message) => message.clone(),
            _ => return Err(event_mismatch(self.kind())),
        };

        if ctx.checkpoint.is_none() && message.payload == SessionPayload::Init {
            return self.start_responder(ctx, message);
        }

        let flow_id = ctx.flow_id.clone();
        let state = &mut ctx.require_checkpoint()?.flow_state;
        let session_id = message.session_id.clone();
        let sequence_number = message.sequence_number;
        if state.session(&session_id).is_none() {
            return Err(CoreError::InvalidEvent(format!(
                "Unknown session {} for flow {}",
                session_id, flow_id
            )));
        }

        match message.payload {
            SessionPayload::Init => {
                debug!(flow_id = %flow_id, %session_id, "Duplicate session init ignored");
            }
            SessionPayload::Confirm => {
                if let Some(session) = state.session_mut(&session_id) {
                    session.confirm();
                }
            }
            SessionPayload::Error { message: error } if sequence_number == 0 => {
                state.mark_errored(&session_id, error);
            }
            payload => buffer_frame(state, &flow_id, session_id, sequence_number, payload)?,
        }
        Ok(ctx)
    }

    fn run_or_continue(&self, ctx: &FlowEventContext) -> RunDecision {
        run_if_satisfiable(ctx)
    }
}

/// Records a counterparty failure on its session
pub struct RemoteFlowErrorHandler;

impl FlowEventHandler for RemoteFlowErrorHandler {
    fn kind(&self) -> FlowEventKind {
        FlowEventKind::RemoteFlowError
    }

    fn preprocess(&self, mut ctx: FlowEventContext) -> Result<FlowEventContext, CoreError> {
        let (session_id, sequence_number, message) = match &ctx.event.payload {
            FlowEventPayload::RemoteFlowError {
                session_id,
                sequence_number,
                message,
            } => (session_id.clone(), *sequence_number, message.clone()),
            _ => return Err(event_mismatch(self.kind())),
        };

        let flow_id = ctx.flow_id.clone();
        let state = &mut ctx.require_checkpoint()?.flow_state;
        if sequence_number > 0 && state.session(&session_id).is_some() {
            buffer_frame(
                state,
                &flow_id,
                session_id,
                sequence_number,
                SessionPayload::Error { message },
            )?;
            return Ok(ctx);
        }
        if !state.mark_errored(&session_id, message) {
            return Err(CoreError::InvalidEvent(format!(
                "Remote error for unknown or closed session {}",
                session_id
            )));
        }
        Ok(ctx)
    }

    fn run_or_continue(&self, ctx: &FlowEventContext) -> RunDecision {
        run_if_satisfiable(ctx)
    }
}

/// Delivers results of off-fiber operations
pub struct ExternalResponseHandler;

impl ExternalResponseHandler {
    fn parked_operation(ctx: &FlowEventContext) -> Option<&str> {
        match ctx.checkpoint.as_ref()?.flow_state.suspended_on.as_ref()?.request {
            IoRequest::ExecuteAsyncOperation { ref operation_id, .. } => Some(operation_id.as_str()),
            _ => None,
        }
    }
}

impl FlowEventHandler for ExternalResponseHandler {
    fn kind(&self) -> FlowEventKind {
        FlowEventKind::ExternalResponse
    }

    fn preprocess(&self, mut ctx: FlowEventContext) -> Result<FlowEventContext, CoreError> {
        let (operation_id, result) = match &ctx.event.payload {
            FlowEventPayload::ExternalResponse { operation_id, result } => (operation_id.clone(), result.clone()),
            _ => return Err(event_mismatch(self.kind())),
        };
        ctx.require_checkpoint()?;

        if Self::parked_operation(&ctx) != Some(operation_id.as_str()) {
            return Err(CoreError::InvalidEvent(format!(
                "Stale response for operation {}",
                operation_id
            )));
        }

        if let Ok(result) = result {
            let state = &mut ctx.require_checkpoint()?.flow_state;
            let already_buffered = state.pending_events.iter().any(|e| {
                matches!(e, PendingEvent::ExternalResponse { operation_id: id, .. } if *id == operation_id)
            });
            if !already_buffered {
                state.pending_events.push(PendingEvent::ExternalResponse { operation_id, result });
            }
        }
        Ok(ctx)
    }

    fn run_or_continue(&self, ctx: &FlowEventContext) -> RunDecision {
        if let FlowEventPayload::ExternalResponse {
            operation_id,
            result: Err(message),
        } = &ctx.event.payload
        {
            return RunDecision::Error(FlowError::AsyncOperationFailed {
                operation_id: operation_id.clone(),
                message: message.clone(),
            });
        }
        run_if_satisfiable(ctx)
    }
}

/// Marks the flow killed; the pipeline tears it down
pub struct KillHandler;

impl FlowEventHandler for KillHandler {
    fn kind(&self) -> FlowEventKind {
        FlowEventKind::Kill
    }

    fn preprocess(&self, mut ctx: FlowEventContext) -> Result<FlowEventContext, CoreError> {
        let flow_id = ctx.flow_id.clone();
        let state = &mut ctx.require_checkpoint()?.flow_state;
        info!(flow_id = %flow_id, "Killing flow");
        state.is_killed = true;
        Ok(ctx)
    }

    fn run_or_continue(&self, _ctx: &FlowEventContext) -> RunDecision {
        RunDecision::Continue
    }
}
