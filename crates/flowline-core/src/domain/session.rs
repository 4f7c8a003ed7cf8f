use serde::{Deserialize, Serialize};

use super::identity::{MemberIdentity, SessionId};
use crate::error::FlowError;

/// Which end of the session this flow is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionRole {
    /// We opened the session
    Initiator,
    /// The counterparty opened the session and started us
    Responder,
}

/// Lifecycle of a session as seen by its owning flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    /// Opened locally, nothing sent yet
    Created,
    /// Init sent, waiting for the counterparty to confirm
    Initiating,
    /// Both ends are up
    Confirmed,
    /// Closed by this flow
    Closed,
    /// Counterparty sent its close frame and it has been consumed
    PeerClosed,
    /// Counterparty flow failed
    Errored {
        /// Error the counterparty reported
        message: String,
    },
}

/// One end of a point-to-point session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    /// Our session id
    pub session_id: SessionId,

    /// Member on the other end
    pub counterparty: MemberIdentity,

    /// Session id used by the counterparty
    pub destination: SessionId,

    /// Flow type name of the initiating flow
    pub protocol: String,

    /// Our role
    pub role: SessionRole,

    /// Last sequence number we sent
    pub outbound_sequence_number: u64,

    /// Next sequence number we accept from the counterparty
    pub inbound_next_sequence_number: u64,

    /// Current status
    pub status: SessionStatus,
}

impl SessionState {
    /// A session opened by this flow. Nothing is sent until first use.
    pub fn initiated(session_id: SessionId, counterparty: MemberIdentity, protocol: String) -> Self {
        let destination = session_id.counterpart();
        Self {
            session_id,
            counterparty,
            destination,
            protocol,
            role: SessionRole::Initiator,
            outbound_sequence_number: 0,
            inbound_next_sequence_number: 1,
            status: SessionStatus::Created,
        }
    }

    /// The responder's end, created when the counterparty's Init (seq 1) arrives
    pub fn responded(session_id: SessionId, counterparty: MemberIdentity, protocol: String) -> Self {
        let destination = session_id.counterpart();
        Self {
            session_id,
            counterparty,
            destination,
            protocol,
            role: SessionRole::Responder,
            outbound_sequence_number: 0,
            inbound_next_sequence_number: 2,
            status: SessionStatus::Confirmed,
        }
    }

    /// Allocate the next outbound sequence number
    pub fn next_outbound_sequence(&mut self) -> u64 {
        self.outbound_sequence_number += 1;
        self.outbound_sequence_number
    }

    /// Whether an inbound sequenced frame has already been seen
    pub fn is_duplicate(&self, sequence_number: u64) -> bool {
        sequence_number < self.inbound_next_sequence_number
    }

    /// Whether this end can still send
    pub fn is_open(&self) -> bool {
        !matches!(
            self.status,
            SessionStatus::Closed | SessionStatus::PeerClosed | SessionStatus::Errored { .. }
        )
    }

    /// Whether the counterparty has been told about this session
    pub fn is_announced(&self) -> bool {
        self.status != SessionStatus::Created
    }

    /// Error raised when flow logic tries to send on this session
    pub fn send_error(&self) -> Option<FlowError> {
        match &self.status {
            SessionStatus::Closed => Some(FlowError::SessionClosed(self.session_id.0.clone())),
            SessionStatus::PeerClosed => {
                Some(FlowError::SessionClosedByPeer(self.session_id.0.clone()))
            }
            SessionStatus::Errored { message } => Some(FlowError::RemoteError {
                session_id: self.session_id.0.clone(),
                message: message.clone(),
            }),
            _ => None,
        }
    }

    /// Mark the session confirmed by the counterparty
    pub fn confirm(&mut self) {
        if matches!(self.status, SessionStatus::Created | SessionStatus::Initiating) {
            self.status = SessionStatus::Confirmed;
        }
    }
}
