use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Suffix marking the responder side of a session
pub const INITIATED_SESSION_SUFFIX: &str = "-INITIATED";

/// Value object: Flow ID, the bus key for every event of one flow run
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowId(pub String);

impl FlowId {
    /// Allocate a fresh flow id
    pub fn generate() -> Self {
        FlowId(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one flow run. Immutable for the lifetime of the flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowIdentity {
    /// Unique run id
    pub flow_id: FlowId,

    /// Correlation id assigned by the client that started the flow
    pub client_request_id: Option<String>,
}

impl FlowIdentity {
    /// Create an identity
    pub fn new(flow_id: FlowId, client_request_id: Option<String>) -> Self {
        Self {
            flow_id,
            client_request_id,
        }
    }
}

/// Value object: network member a flow runs as or talks to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberIdentity(pub String);

impl fmt::Display for MemberIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Value object: transport address a member is reachable at
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PhysicalAddress(pub String);

/// Value object: Session ID.
///
/// Both ends of a session share a base id; the responder's end carries the
/// [`INITIATED_SESSION_SUFFIX`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Allocate a fresh initiator-side session id
    pub fn generate() -> Self {
        SessionId(Uuid::new_v4().to_string())
    }

    /// Whether this is the responder's end of a session
    pub fn is_initiated(&self) -> bool {
        self.0.ends_with(INITIATED_SESSION_SUFFIX)
    }

    /// The session id used by the other end
    pub fn counterpart(&self) -> SessionId {
        match self.0.strip_suffix(INITIATED_SESSION_SUFFIX) {
            Some(base) => SessionId(base.to_string()),
            None => SessionId(format!("{}{}", self.0, INITIATED_SESSION_SUFFIX)),
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
