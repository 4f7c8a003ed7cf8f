//! Suspension requests.
//!
//! Every request a flow can park on, the outbound effects each one implies,
//! and how buffered inbound events satisfy it. Matching never mutates state
//! directly: [`IoRequest::resolve`] describes what to consume and
//! [`Resolution::apply`] consumes it, so a request is either satisfied
//! completely or not touched at all.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::checkpoint::{FlowState, PendingEvent};
use super::events::SessionPayload;
use super::identity::{MemberIdentity, SessionId};
use super::session::{SessionRole, SessionStatus};
use crate::error::FlowError;
use crate::types::Payload;

/// What a flow is waiting for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoRequest {
    /// Persist and continue on the next Wakeup
    ForceCheckpoint,

    /// Send one payload per session, continue on the trailing Wakeup
    Send {
        /// Payload per session
        payloads: BTreeMap<SessionId, Payload>,
    },

    /// Wait for the next payload on every listed session
    Receive {
        /// Sessions to receive from
        sessions: BTreeSet<SessionId>,
    },

    /// Send then wait for the reply on each session
    SendAndReceive {
        /// Payload per session
        payloads: BTreeMap<SessionId, Payload>,
    },

    /// Close sessions, continue on the trailing Wakeup
    CloseSessions {
        /// Sessions to close
        sessions: BTreeSet<SessionId>,
    },

    /// Park until a deadline
    Sleep {
        /// Earliest instant the flow may resume
        wake_at: DateTime<Utc>,
    },

    /// Read session metadata
    GetFlowInfo {
        /// Sessions to describe
        sessions: BTreeSet<SessionId>,
    },

    /// Run work off the fiber and resume with its result
    ExecuteAsyncOperation {
        /// Correlation id of the operation
        operation_id: String,
        /// Operation name understood by the executor
        operation: String,
        /// Operation input
        input: Payload,
    },

    /// Wait until the counterparties have confirmed the sessions
    WaitForSessionConfirmations {
        /// Sessions to wait on
        sessions: BTreeSet<SessionId>,
    },
}

/// Discriminant of [`IoRequest`], journaled to detect divergent replay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IoRequestKind {
    /// [`IoRequest::ForceCheckpoint`]
    ForceCheckpoint,
    /// [`IoRequest::Send`]
    Send,
    /// [`IoRequest::Receive`]
    Receive,
    /// [`IoRequest::SendAndReceive`]
    SendAndReceive,
    /// [`IoRequest::CloseSessions`]
    CloseSessions,
    /// [`IoRequest::Sleep`]
    Sleep,
    /// [`IoRequest::GetFlowInfo`]
    GetFlowInfo,
    /// [`IoRequest::ExecuteAsyncOperation`]
    ExecuteAsyncOperation,
    /// [`IoRequest::WaitForSessionConfirmations`]
    WaitForSessionConfirmations,
}

/// Session metadata returned by [`IoRequest::GetFlowInfo`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowInfo {
    /// Initiating flow type of the session
    pub protocol: String,
    /// Member on the other end
    pub counterparty: MemberIdentity,
    /// Our role
    pub role: SessionRole,
    /// Current status
    pub status: SessionStatus,
}

/// Value a satisfied request resumes the flow with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoResult {
    /// Nothing to return
    Unit,
    /// One payload per session
    Received(BTreeMap<SessionId, Payload>),
    /// Session metadata
    FlowInfo(BTreeMap<SessionId, FlowInfo>),
    /// Result of an async operation
    AsyncResult(Payload),
}

/// How a request is satisfied from the current state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    consumed: Vec<usize>,
    advanced: Vec<SessionId>,
    status_updates: Vec<(SessionId, SessionStatus)>,
    outcome: Result<IoResult, FlowError>,
}

impl Resolution {
    fn ready(outcome: Result<IoResult, FlowError>) -> Self {
        Self {
            consumed: Vec::new(),
            advanced: Vec::new(),
            status_updates: Vec::new(),
            outcome,
        }
    }

    fn consuming(index: usize, outcome: Result<IoResult, FlowError>) -> Self {
        Self {
            consumed: vec![index],
            ..Self::ready(outcome)
        }
    }

    /// Result the flow will resume with
    pub fn outcome(&self) -> &Result<IoResult, FlowError> {
        &self.outcome
    }

    /// Consume the matched events and return the outcome
    pub fn apply(mut self, state: &mut FlowState) -> Result<IoResult, FlowError> {
        self.consumed.sort_unstable();
        for index in self.consumed.into_iter().rev() {
            state.pending_events.remove(index);
        }
        for session_id in &self.advanced {
            if let Some(session) = state.session_mut(session_id) {
                session.inbound_next_sequence_number += 1;
            }
        }
        for (session_id, status) in self.status_updates {
            if let Some(session) = state.session_mut(&session_id) {
                session.status = status;
            }
        }
        self.outcome
    }
}

enum SessionRead {
    Ready(usize, Payload),
    Waiting,
    Failed(Resolution),
}

impl IoRequest {
    /// Discriminant
    pub fn kind(&self) -> IoRequestKind {
        match self {
            IoRequest::ForceCheckpoint => IoRequestKind::ForceCheckpoint,
            IoRequest::Send { .. } => IoRequestKind::Send,
            IoRequest::Receive { .. } => IoRequestKind::Receive,
            IoRequest::SendAndReceive { .. } => IoRequestKind::SendAndReceive,
            IoRequest::CloseSessions { .. } => IoRequestKind::CloseSessions,
            IoRequest::Sleep { .. } => IoRequestKind::Sleep,
            IoRequest::GetFlowInfo { .. } => IoRequestKind::GetFlowInfo,
            IoRequest::ExecuteAsyncOperation { .. } => IoRequestKind::ExecuteAsyncOperation,
            IoRequest::WaitForSessionConfirmations { .. } => IoRequestKind::WaitForSessionConfirmations,
        }
    }

    /// Sessions the request refers to
    pub fn sessions(&self) -> Vec<SessionId> {
        match self {
            IoRequest::Send { payloads } | IoRequest::SendAndReceive { payloads } => {
                payloads.keys().cloned().collect()
            }
            IoRequest::Receive { sessions }
            | IoRequest::CloseSessions { sessions }
            | IoRequest::GetFlowInfo { sessions }
            | IoRequest::WaitForSessionConfirmations { sessions } => sessions.iter().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Whether a Wakeup event can satisfy this request
    pub fn accepts_wakeup(&self) -> bool {
        matches!(
            self,
            IoRequest::ForceCheckpoint
                | IoRequest::Send { .. }
                | IoRequest::CloseSessions { .. }
                | IoRequest::Sleep { .. }
        )
    }

    /// Whether parking on this request emits outbound records
    pub fn has_outbound_effects(&self, state: &FlowState) -> bool {
        match self {
            IoRequest::ForceCheckpoint
            | IoRequest::Send { .. }
            | IoRequest::SendAndReceive { .. }
            | IoRequest::CloseSessions { .. }
            | IoRequest::Sleep { .. }
            | IoRequest::ExecuteAsyncOperation { .. } => true,
            IoRequest::Receive { sessions } | IoRequest::WaitForSessionConfirmations { sessions } => {
                sessions.iter().any(|id| {
                    state
                        .session(id)
                        .map(|s| s.status == SessionStatus::Created)
                        .unwrap_or(false)
                })
            }
            IoRequest::GetFlowInfo { .. } => false,
        }
    }

    /// Check the request against the flow's sessions before it is acted on
    pub fn validate(&self, state: &FlowState) -> Result<(), FlowError> {
        for session_id in self.sessions() {
            let session = state
                .session(&session_id)
                .ok_or_else(|| FlowError::UnknownSession(session_id.0.clone()))?;

            match self {
                IoRequest::Send { .. } | IoRequest::SendAndReceive { .. } => {
                    if let Some(err) = session.send_error() {
                        return Err(err);
                    }
                }
                IoRequest::Receive { .. } | IoRequest::WaitForSessionConfirmations { .. } => {
                    if session.status == SessionStatus::Closed {
                        return Err(FlowError::SessionClosed(session_id.0.clone()));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Whether the request is satisfiable from buffered events right now
    pub fn can_satisfy(&self, state: &FlowState, now: DateTime<Utc>) -> bool {
        self.resolve(state, now).is_some()
    }

    /// Work out how buffered events satisfy the request, if they do
    pub fn resolve(&self, state: &FlowState, now: DateTime<Utc>) -> Option<Resolution> {
        match self {
            IoRequest::ForceCheckpoint | IoRequest::Send { .. } | IoRequest::CloseSessions { .. } => {
                wakeup_index(state).map(|index| Resolution::consuming(index, Ok(IoResult::Unit)))
            }
            IoRequest::Sleep { wake_at } => {
                if now < *wake_at {
                    return None;
                }
                wakeup_index(state).map(|index| Resolution::consuming(index, Ok(IoResult::Unit)))
            }
            IoRequest::Receive { sessions } => resolve_receive(state, sessions.iter()),
            IoRequest::SendAndReceive { payloads } => resolve_receive(state, payloads.keys()),
            IoRequest::GetFlowInfo { sessions } => {
                let mut infos = BTreeMap::new();
                for session_id in sessions {
                    match state.session(session_id) {
                        Some(session) => {
                            infos.insert(
                                session_id.clone(),
                                FlowInfo {
                                    protocol: session.protocol.clone(),
                                    counterparty: session.counterparty.clone(),
                                    role: session.role,
                                    status: session.status.clone(),
                                },
                            );
                        }
                        None => {
                            return Some(Resolution::ready(Err(FlowError::UnknownSession(
                                session_id.0.clone(),
                            ))))
                        }
                    }
                }
                Some(Resolution::ready(Ok(IoResult::FlowInfo(infos))))
            }
            IoRequest::ExecuteAsyncOperation { operation_id, .. } => {
                state.pending_events.iter().enumerate().find_map(|(index, event)| match event {
                    PendingEvent::ExternalResponse {
                        operation_id: id,
                        result,
                    } if id == operation_id => {
                        Some(Resolution::consuming(index, Ok(IoResult::AsyncResult(result.clone()))))
                    }
                    _ => None,
                })
            }
            IoRequest::WaitForSessionConfirmations { sessions } => {
                let mut waiting = false;
                for session_id in sessions {
                    let session = match state.session(session_id) {
                        Some(session) => session,
                        None => {
                            return Some(Resolution::ready(Err(FlowError::UnknownSession(
                                session_id.0.clone(),
                            ))))
                        }
                    };
                    if let Some((index, SessionPayload::Error { message })) =
                        next_frame(state, session_id, session.inbound_next_sequence_number)
                    {
                        return Some(remote_error(session_id, index, message));
                    }
                    match &session.status {
                        SessionStatus::Errored { message } => {
                            return Some(Resolution::ready(Err(FlowError::RemoteError {
                                session_id: session_id.0.clone(),
                                message: message.clone(),
                            })))
                        }
                        SessionStatus::Created | SessionStatus::Initiating => waiting = true,
                        _ => {}
                    }
                }
                if waiting {
                    None
                } else {
                    Some(Resolution::ready(Ok(IoResult::Unit)))
                }
            }
        }
    }
}

fn wakeup_index(state: &FlowState) -> Option<usize> {
    state
        .pending_events
        .iter()
        .position(|e| matches!(e, PendingEvent::Wakeup))
}

fn resolve_receive<'a>(state: &FlowState, sessions: impl Iterator<Item = &'a SessionId>) -> Option<Resolution> {
    let mut ready = Vec::new();
    let mut waiting = false;

    for session_id in sessions {
        match read_session(state, session_id) {
            SessionRead::Ready(index, payload) => ready.push((session_id.clone(), index, payload)),
            SessionRead::Waiting => waiting = true,
            SessionRead::Failed(resolution) => return Some(resolution),
        }
    }

    if waiting {
        return None;
    }

    let mut resolution = Resolution::ready(Ok(IoResult::Unit));
    let mut received = BTreeMap::new();
    for (session_id, index, payload) in ready {
        resolution.consumed.push(index);
        resolution.advanced.push(session_id.clone());
        received.insert(session_id, payload);
    }
    resolution.outcome = Ok(IoResult::Received(received));
    Some(resolution)
}

/// Buffered frame carrying the given sequence number on a session
fn next_frame<'a>(
    state: &'a FlowState,
    session_id: &SessionId,
    expected: u64,
) -> Option<(usize, &'a SessionPayload)> {
    state.pending_events.iter().enumerate().find_map(|(index, event)| match event {
        PendingEvent::SessionFrame {
            session_id: s,
            sequence_number,
            payload,
        } if s == session_id && *sequence_number == expected => Some((index, payload)),
        _ => None,
    })
}

/// Consume an in-order Error frame, recording the failure on the session
fn remote_error(session_id: &SessionId, index: usize, message: &str) -> Resolution {
    Resolution {
        consumed: vec![index],
        advanced: vec![session_id.clone()],
        status_updates: vec![(
            session_id.clone(),
            SessionStatus::Errored {
                message: message.to_string(),
            },
        )],
        outcome: Err(FlowError::RemoteError {
            session_id: session_id.0.clone(),
            message: message.to_string(),
        }),
    }
}

fn read_session(state: &FlowState, session_id: &SessionId) -> SessionRead {
    let session = match state.session(session_id) {
        Some(session) => session,
        None => {
            return SessionRead::Failed(Resolution::ready(Err(FlowError::UnknownSession(
                session_id.0.clone(),
            ))))
        }
    };

    match next_frame(state, session_id, session.inbound_next_sequence_number) {
        Some((index, SessionPayload::Data(payload))) => SessionRead::Ready(index, payload.clone()),
        Some((index, SessionPayload::Error { message })) => {
            SessionRead::Failed(remote_error(session_id, index, message))
        }
        Some((index, _)) => SessionRead::Failed(Resolution {
            consumed: vec![index],
            advanced: vec![session_id.clone()],
            status_updates: vec![(session_id.clone(), SessionStatus::PeerClosed)],
            outcome: Err(FlowError::SessionClosedByPeer(session_id.0.clone())),
        }),
        None => match &session.status {
            SessionStatus::Errored { message } => SessionRead::Failed(Resolution::ready(Err(
                FlowError::RemoteError {
                    session_id: session_id.0.clone(),
                    message: message.clone(),
                },
            ))),
            SessionStatus::PeerClosed => SessionRead::Failed(Resolution::ready(Err(
                FlowError::SessionClosedByPeer(session_id.0.clone()),
            ))),
            SessionStatus::Closed => SessionRead::Failed(Resolution::ready(Err(FlowError::SessionClosed(
                session_id.0.clone(),
            )))),
            _ => SessionRead::Waiting,
        },
    }
}
