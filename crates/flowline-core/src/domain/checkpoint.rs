use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::events::SessionPayload;
use super::flow_stack::FlowStack;
use super::identity::{FlowIdentity, MemberIdentity, SessionId};
use super::io_request::IoRequest;
use super::session::{SessionState, SessionStatus};
use crate::types::Payload;

/// How the flow came to exist
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvocationContext {
    /// Started by a client request
    Rpc {
        /// Correlation id the result is published under
        client_request_id: String,
        /// User that asked for the flow
        requester: String,
    },
    /// Started by a counterparty opening a session
    Initiated {
        /// Our end of the initiating session
        session_id: SessionId,
        /// Member that opened the session
        initiator: MemberIdentity,
        /// Initiating flow type
        protocol: String,
    },
}

/// Inbound event waiting to be consumed by a suspension request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingEvent {
    /// Wakeup for a checkpoint, send, close or sleep
    Wakeup,

    /// Sequenced Data, Close or Error frame, possibly ahead of the expected sequence
    SessionFrame {
        /// Our end of the session
        session_id: SessionId,
        /// Frame sequence number
        sequence_number: u64,
        /// Frame body
        payload: SessionPayload,
    },

    /// Successful completion of an off-fiber operation
    ExternalResponse {
        /// Operation id
        operation_id: String,
        /// Operation result
        result: Payload,
    },
}

/// Request the flow is parked on, and where in the journal it parked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspendedOn {
    /// Parked request, as recorded when the flow first reached it
    pub request: IoRequest,

    /// Journal position of the parked request
    pub resume_index: usize,
}

/// Mutable state of one flow run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowState {
    /// Registered type of the top-level flow
    pub flow_type: String,

    /// Arguments the top-level flow was constructed with
    pub start_args: Payload,

    /// Number of times the flow has parked
    pub suspend_count: u64,

    /// How the flow was started
    pub invocation_context: InvocationContext,

    /// Member the flow runs as
    pub owner: MemberIdentity,

    /// Terminal kill flag
    pub is_killed: bool,

    /// Session that started us, for initiated flows
    pub initiating_session: Option<SessionId>,

    /// Sessions owned by this flow
    pub sessions: BTreeMap<SessionId, SessionState>,

    /// Subflow call stack
    pub flow_stack: FlowStack,

    /// Inbound events not yet consumed
    pub pending_events: Vec<PendingEvent>,

    /// Request the flow is parked on
    pub suspended_on: Option<SuspendedOn>,
}

impl FlowState {
    /// State for a flow started by a client request
    pub fn for_rpc(
        flow_type: impl Into<String>,
        start_args: Payload,
        owner: MemberIdentity,
        client_request_id: impl Into<String>,
        requester: impl Into<String>,
    ) -> Self {
        Self::new(
            flow_type.into(),
            start_args,
            owner,
            InvocationContext::Rpc {
                client_request_id: client_request_id.into(),
                requester: requester.into(),
            },
        )
    }

    /// State for a responder started by a session Init
    pub fn for_initiated(flow_type: impl Into<String>, owner: MemberIdentity, session: SessionState) -> Self {
        let mut state = Self::new(
            flow_type.into(),
            Payload::empty(),
            owner,
            InvocationContext::Initiated {
                session_id: session.session_id.clone(),
                initiator: session.counterparty.clone(),
                protocol: session.protocol.clone(),
            },
        );
        state.initiating_session = Some(session.session_id.clone());
        state.sessions.insert(session.session_id.clone(), session);
        state
    }

    fn new(flow_type: String, start_args: Payload, owner: MemberIdentity, invocation_context: InvocationContext) -> Self {
        Self {
            flow_type,
            start_args,
            suspend_count: 0,
            invocation_context,
            owner,
            is_killed: false,
            initiating_session: None,
            sessions: BTreeMap::new(),
            flow_stack: FlowStack::new(),
            pending_events: Vec::new(),
            suspended_on: None,
        }
    }

    /// Look up a session
    pub fn session(&self, session_id: &SessionId) -> Option<&SessionState> {
        self.sessions.get(session_id)
    }

    /// Look up a session for mutation
    pub fn session_mut(&mut self, session_id: &SessionId) -> Option<&mut SessionState> {
        self.sessions.get_mut(session_id)
    }

    /// Client request id, for RPC-started flows
    pub fn client_request_id(&self) -> Option<&str> {
        match &self.invocation_context {
            InvocationContext::Rpc { client_request_id, .. } => Some(client_request_id),
            InvocationContext::Initiated { .. } => None,
        }
    }

    /// Whether a Wakeup is buffered
    pub fn has_pending_wakeup(&self) -> bool {
        self.pending_events.iter().any(|e| matches!(e, PendingEvent::Wakeup))
    }

    /// Drop buffered Wakeups
    pub fn clear_pending_wakeups(&mut self) {
        self.pending_events.retain(|e| !matches!(e, PendingEvent::Wakeup));
    }

    /// Whether a sequenced frame for this session and sequence number is buffered
    pub fn has_buffered_frame(&self, session_id: &SessionId, sequence_number: u64) -> bool {
        self.pending_events.iter().any(|e| match e {
            PendingEvent::SessionFrame {
                session_id: s,
                sequence_number: n,
                ..
            } => s == session_id && *n == sequence_number,
            _ => false,
        })
    }

    /// Sessions the counterparty still expects traffic on
    pub fn announced_open_sessions(&self) -> Vec<SessionId> {
        self.sessions
            .values()
            .filter(|s| s.is_announced() && s.is_open())
            .map(|s| s.session_id.clone())
            .collect()
    }

    /// Mark a session failed by its counterparty
    pub fn mark_errored(&mut self, session_id: &SessionId, message: impl Into<String>) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(session) if session.status != SessionStatus::Closed => {
                session.status = SessionStatus::Errored {
                    message: message.into(),
                };
                true
            }
            _ => false,
        }
    }
}

/// Durable snapshot of a flow between events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Identity of the flow run
    pub flow_identity: FlowIdentity,

    /// Continuation bytes owned by the execution engine
    pub serialized_continuation: Option<Vec<u8>>,

    /// Flow state
    pub flow_state: FlowState,
}

impl Checkpoint {
    /// Fresh checkpoint with no continuation
    pub fn new(flow_identity: FlowIdentity, flow_state: FlowState) -> Self {
        Self {
            flow_identity,
            serialized_continuation: None,
            flow_state,
        }
    }
}
