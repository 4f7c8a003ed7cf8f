//! Translation of parked requests into outbound records.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::domain::checkpoint::FlowState;
use crate::domain::events::{P2PMessage, SessionPayload};
use crate::domain::identity::{FlowId, SessionId};
use crate::domain::io_request::IoRequest;
use crate::domain::records::Record;
use crate::domain::repository::AddressResolver;
use crate::domain::session::SessionStatus;
use crate::error::CoreError;
use crate::types::Payload;

/// Build the record carrying one frame on a session, allocating its sequence
/// number for sequenced frames
pub(crate) fn session_frame(
    resolver: &dyn AddressResolver,
    flow_id: &FlowId,
    state: &mut FlowState,
    session_id: &SessionId,
    payload: SessionPayload,
) -> Result<Record, CoreError> {
    let owner = state.owner.clone();
    let session = state
        .session_mut(session_id)
        .ok_or_else(|| CoreError::InvalidEvent(format!("Unknown session: {}", session_id)))?;

    let sequence_number = if payload.is_sequenced() {
        session.next_outbound_sequence()
    } else {
        0
    };
    let address = resolver.resolve(&session.counterparty)?;

    Ok(Record::p2p(
        address,
        P2PMessage {
            flow_id: flow_id.clone(),
            initiating_flow: session.protocol.clone(),
            sender: owner,
            recipient: session.counterparty.clone(),
            session_id: session.destination.clone(),
            sequence_number,
            payload,
        },
    ))
}

/// Emit Init for a session nobody has been told about yet
fn announce(
    resolver: &dyn AddressResolver,
    flow_id: &FlowId,
    state: &mut FlowState,
    session_id: &SessionId,
    records: &mut Vec<Record>,
) -> Result<(), CoreError> {
    let created = state
        .session(session_id)
        .map(|s| s.status == SessionStatus::Created)
        .unwrap_or(false);

    if created {
        records.push(session_frame(resolver, flow_id, state, session_id, SessionPayload::Init)?);
        if let Some(session) = state.session_mut(session_id) {
            session.status = SessionStatus::Initiating;
        }
    }
    Ok(())
}

fn send_payloads(
    resolver: &dyn AddressResolver,
    flow_id: &FlowId,
    state: &mut FlowState,
    payloads: &std::collections::BTreeMap<SessionId, Payload>,
    records: &mut Vec<Record>,
) -> Result<(), CoreError> {
    for (session_id, payload) in payloads {
        announce(resolver, flow_id, state, session_id, records)?;
        records.push(session_frame(
            resolver,
            flow_id,
            state,
            session_id,
            SessionPayload::Data(payload.clone()),
        )?);
    }
    Ok(())
}

/// Records a freshly parked request implies, applying the session changes
/// they carry to `state`
pub fn post_process_request(
    resolver: &dyn AddressResolver,
    flow_id: &FlowId,
    state: &mut FlowState,
    request: &IoRequest,
    now: DateTime<Utc>,
) -> Result<Vec<Record>, CoreError> {
    let mut records = Vec::new();

    match request {
        IoRequest::ForceCheckpoint => records.push(Record::wakeup(flow_id)),
        IoRequest::Send { payloads } => {
            send_payloads(resolver, flow_id, state, payloads, &mut records)?;
            records.push(Record::wakeup(flow_id));
        }
        IoRequest::SendAndReceive { payloads } => {
            send_payloads(resolver, flow_id, state, payloads, &mut records)?;
        }
        IoRequest::Receive { sessions } | IoRequest::WaitForSessionConfirmations { sessions } => {
            for session_id in sessions {
                announce(resolver, flow_id, state, session_id, &mut records)?;
            }
        }
        IoRequest::CloseSessions { sessions } => {
            for session_id in sessions {
                let status = match state.session(session_id) {
                    Some(session) => session.status.clone(),
                    None => continue,
                };
                match status {
                    SessionStatus::Initiating | SessionStatus::Confirmed => {
                        records.push(session_frame(resolver, flow_id, state, session_id, SessionPayload::Close)?);
                    }
                    SessionStatus::Created | SessionStatus::PeerClosed => {
                        debug!(%session_id, "Closing session locally");
                    }
                    SessionStatus::Closed | SessionStatus::Errored { .. } => continue,
                }
                if let Some(session) = state.session_mut(session_id) {
                    session.status = SessionStatus::Closed;
                }
            }
            records.push(Record::wakeup(flow_id));
        }
        IoRequest::Sleep { wake_at } => {
            if *wake_at <= now {
                records.push(Record::wakeup(flow_id));
            } else {
                records.push(Record::delayed_wakeup(flow_id, *wake_at));
            }
        }
        IoRequest::GetFlowInfo { .. } => {}
        IoRequest::ExecuteAsyncOperation {
            operation_id,
            operation,
            input,
        } => {
            records.push(Record::external_request(flow_id, operation_id, operation, input.clone()));
        }
    }

    if !request.accepts_wakeup() && request.can_satisfy(state, now) {
        records.push(Record::wakeup(flow_id));
    }

    Ok(records)
}
