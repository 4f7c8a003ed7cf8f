use serde::{Deserialize, Serialize};

use super::identity::{FlowId, MemberIdentity, SessionId};
use crate::types::Payload;

/// Body of a point-to-point session frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionPayload {
    /// First sequenced frame of an initiated session. Starts the responder.
    Init,
    /// Application data
    Data(Payload),
    /// Unsequenced reply from the responder once it is up
    Confirm,
    /// Sequenced close frame. No further frames follow on this session.
    Close,
    /// Counterparty flow failed
    Error {
        /// Reported failure
        message: String,
    },
}

impl SessionPayload {
    /// Whether the frame carries a sequence number the receiver must order on.
    /// Error frames are ordered behind the data sent before them.
    pub fn is_sequenced(&self) -> bool {
        !matches!(self, SessionPayload::Confirm)
    }

    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            SessionPayload::Init => "init",
            SessionPayload::Data(_) => "data",
            SessionPayload::Confirm => "confirm",
            SessionPayload::Close => "close",
            SessionPayload::Error { .. } => "error",
        }
    }
}

/// Frame exchanged between the two ends of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct P2PMessage {
    /// Flow that sent the frame
    pub flow_id: FlowId,

    /// Protocol (initiating flow type) of the session
    pub initiating_flow: String,

    /// Sending member
    pub sender: MemberIdentity,

    /// Receiving member
    pub recipient: MemberIdentity,

    /// Session id on the receiving side
    pub session_id: SessionId,

    /// Sequence number, zero for unsequenced frames
    pub sequence_number: u64,

    /// Frame body
    pub payload: SessionPayload,
}

/// Request to start a flow on behalf of a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartFlow {
    /// Registered flow type name
    pub flow_type: String,

    /// Start arguments handed to the flow constructor
    pub args: Payload,

    /// Correlation id of the client request
    pub client_request_id: String,

    /// User that asked for the flow
    pub requester: String,

    /// Member the flow runs as
    pub owner: MemberIdentity,
}

/// Discriminant of [`FlowEventPayload`], used as the handler dispatch key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowEventKind {
    /// Start a flow
    StartFlow,
    /// Resume a flow parked on a checkpoint, send or sleep
    Wakeup,
    /// Session frame
    SessionEvent,
    /// Counterparty failed
    RemoteFlowError,
    /// Result of an off-fiber operation
    ExternalResponse,
    /// Kill the flow
    Kill,
}

impl FlowEventKind {
    /// Every kind, in dispatch-table order
    pub const ALL: [FlowEventKind; 6] = [
        FlowEventKind::StartFlow,
        FlowEventKind::Wakeup,
        FlowEventKind::SessionEvent,
        FlowEventKind::RemoteFlowError,
        FlowEventKind::ExternalResponse,
        FlowEventKind::Kill,
    ];

    /// Event type name for logs
    pub fn event_type(&self) -> &'static str {
        match self {
            FlowEventKind::StartFlow => "flow.start",
            FlowEventKind::Wakeup => "flow.wakeup",
            FlowEventKind::SessionEvent => "flow.session_event",
            FlowEventKind::RemoteFlowError => "flow.remote_error",
            FlowEventKind::ExternalResponse => "flow.external_response",
            FlowEventKind::Kill => "flow.kill",
        }
    }
}

/// What happened to a flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowEventPayload {
    /// Start a new flow
    StartFlow(StartFlow),

    /// Nudge a parked flow
    Wakeup,

    /// Inbound session frame
    P2PMessage(P2PMessage),

    /// Counterparty flow on a session failed
    RemoteFlowError {
        /// Our end of the session
        session_id: SessionId,
        /// Position in the session stream, 0 when the error was sent outside it
        sequence_number: u64,
        /// Reported failure
        message: String,
    },

    /// Completion of an off-fiber operation
    ExternalResponse {
        /// Operation the flow is waiting on
        operation_id: String,
        /// Result or failure message
        result: Result<Payload, String>,
    },

    /// Kill the flow
    Kill {
        /// Why the flow is being killed
        reason: String,
    },
}

impl FlowEventPayload {
    /// Dispatch key
    pub fn kind(&self) -> FlowEventKind {
        match self {
            FlowEventPayload::StartFlow(_) => FlowEventKind::StartFlow,
            FlowEventPayload::Wakeup => FlowEventKind::Wakeup,
            FlowEventPayload::P2PMessage(_) => FlowEventKind::SessionEvent,
            FlowEventPayload::RemoteFlowError { .. } => FlowEventKind::RemoteFlowError,
            FlowEventPayload::ExternalResponse { .. } => FlowEventKind::ExternalResponse,
            FlowEventPayload::Kill { .. } => FlowEventKind::Kill,
        }
    }
}

/// Event keyed by the flow it is addressed to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEvent {
    /// Target flow
    pub flow_id: FlowId,

    /// Event body
    pub payload: FlowEventPayload,
}

impl FlowEvent {
    /// Create an event
    pub fn new(flow_id: FlowId, payload: FlowEventPayload) -> Self {
        Self { flow_id, payload }
    }

    /// Wakeup for a flow
    pub fn wakeup(flow_id: FlowId) -> Self {
        Self::new(flow_id, FlowEventPayload::Wakeup)
    }

    /// Dispatch key
    pub fn kind(&self) -> FlowEventKind {
        self.payload.kind()
    }
}
