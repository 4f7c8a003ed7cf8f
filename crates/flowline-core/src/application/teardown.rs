//! Flow termination: completion, failure and kill.

use tracing::{info, warn};

use super::pipeline::FlowEventContext;
use super::requests::session_frame;
use crate::domain::events::SessionPayload;
use crate::domain::records::{FlowRunStatus, Record, RpcFlowResult};
use crate::domain::repository::AddressResolver;
use crate::domain::session::SessionStatus;
use crate::error::{CoreError, FlowError};
use crate::types::Payload;

/// Close remaining sessions, report the result and tombstone the checkpoint
pub fn complete(
    ctx: &mut FlowEventContext,
    resolver: &dyn AddressResolver,
    result: Payload,
) -> Result<(), CoreError> {
    let mut checkpoint = match ctx.checkpoint.take() {
        Some(checkpoint) => checkpoint,
        None => return Ok(()),
    };
    let state = &mut checkpoint.flow_state;

    for session_id in state.announced_open_sessions() {
        ctx.records
            .push(session_frame(resolver, &ctx.flow_id, state, &session_id, SessionPayload::Close)?);
        if let Some(session) = state.session_mut(&session_id) {
            session.status = SessionStatus::Closed;
        }
    }

    if let Some(client_request_id) = state.client_request_id() {
        ctx.records.push(Record::rpc_result(RpcFlowResult {
            client_request_id: client_request_id.to_string(),
            flow_id: ctx.flow_id.clone(),
            status: FlowRunStatus::Completed,
            result: Some(result),
            error: None,
        }));
    }

    info!(flow_id = %ctx.flow_id, flow_type = %state.flow_type, "Flow completed");
    ctx.terminated = true;
    Ok(())
}

/// Report the error to every counterparty and the RPC caller, then tombstone
pub fn fail(ctx: &mut FlowEventContext, resolver: &dyn AddressResolver, error: FlowError) -> Result<(), CoreError> {
    terminate_with_error(ctx, resolver, error, FlowRunStatus::Failed)
}

/// Tear down a killed flow
pub fn kill(ctx: &mut FlowEventContext, resolver: &dyn AddressResolver, reason: String) -> Result<(), CoreError> {
    terminate_with_error(ctx, resolver, FlowError::Killed(reason), FlowRunStatus::Killed)
}

fn terminate_with_error(
    ctx: &mut FlowEventContext,
    resolver: &dyn AddressResolver,
    error: FlowError,
    status: FlowRunStatus,
) -> Result<(), CoreError> {
    let mut checkpoint = match ctx.checkpoint.take() {
        Some(checkpoint) => checkpoint,
        None => return Ok(()),
    };
    let state = &mut checkpoint.flow_state;
    let message = error.to_string();

    for session_id in state.announced_open_sessions() {
        ctx.records.push(session_frame(
            resolver,
            &ctx.flow_id,
            state,
            &session_id,
            SessionPayload::Error {
                message: message.clone(),
            },
        )?);
        if let Some(session) = state.session_mut(&session_id) {
            session.status = SessionStatus::Closed;
        }
    }

    if let Some(client_request_id) = state.client_request_id() {
        ctx.records.push(Record::rpc_result(RpcFlowResult {
            client_request_id: client_request_id.to_string(),
            flow_id: ctx.flow_id.clone(),
            status,
            result: None,
            error: Some(error),
        }));
    }

    warn!(flow_id = %ctx.flow_id, flow_type = %state.flow_type, ?status, "Flow terminated: {}", message);
    ctx.terminated = true;
    Ok(())
}
