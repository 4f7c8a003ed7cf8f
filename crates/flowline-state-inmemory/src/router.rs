use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use flowline_core::{FlowEvent, FlowEventPayload, FlowId, MemberIdentity, P2PMessage, SessionId, SessionPayload};

/// Maps inbound session frames for one member to the flows that own them.
///
/// The local end of a session is learned either from an outbound frame (the
/// sender owns the counterpart of the destination id) or from an inbound
/// Init, which allocates a new flow id for the responder.
pub struct LoopbackSessionRouter {
    member: MemberIdentity,
    sessions: RwLock<HashMap<SessionId, FlowId>>,
}

impl LoopbackSessionRouter {
    /// Router for `member`
    pub fn new(member: MemberIdentity) -> Self {
        Self {
            member,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Member this router delivers for
    pub fn member(&self) -> &MemberIdentity {
        &self.member
    }

    /// Flow owning a local session id
    pub async fn flow_for(&self, session_id: &SessionId) -> Option<FlowId> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Learn the local session behind a frame this member is sending
    pub async fn observe_outbound(&self, message: &P2PMessage) {
        let local = message.session_id.counterpart();
        let mut sessions = self.sessions.write().await;
        if !sessions.contains_key(&local) {
            debug!(session_id = %local, flow_id = %message.flow_id, "Learned local session");
            sessions.insert(local, message.flow_id.clone());
        }
    }

    /// Turn an inbound frame into an event for the owning flow.
    ///
    /// Returns `None` for frames addressed elsewhere and for frames on
    /// unknown sessions other than Init.
    pub async fn route(&self, message: P2PMessage) -> Option<FlowEvent> {
        if message.recipient != self.member {
            warn!(
                recipient = %message.recipient,
                member = %self.member,
                "Dropping frame addressed to another member"
            );
            return None;
        }

        let known = self.flow_for(&message.session_id).await;
        let flow_id = match known {
            Some(flow_id) => flow_id,
            None if message.payload == SessionPayload::Init => {
                let flow_id = FlowId::generate();
                debug!(session_id = %message.session_id, flow_id = %flow_id, "Routing session init to new flow");
                self.sessions
                    .write()
                    .await
                    .insert(message.session_id.clone(), flow_id.clone());
                flow_id
            }
            None => {
                warn!(
                    session_id = %message.session_id,
                    payload = message.payload.name(),
                    "Dropping frame for unknown session"
                );
                return None;
            }
        };

        let payload = match message.payload {
            SessionPayload::Error { message: error } => FlowEventPayload::RemoteFlowError {
                session_id: message.session_id,
                sequence_number: message.sequence_number,
                message: error,
            },
            _ => FlowEventPayload::P2PMessage(message),
        };
        Some(FlowEvent::new(flow_id, payload))
    }
}
