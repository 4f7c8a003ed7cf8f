use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::events::{FlowEvent, P2PMessage};
use super::identity::{FlowId, PhysicalAddress};
use crate::error::FlowError;
use crate::types::Payload;

/// Bus topics the engine reads and writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    /// Events keyed by flow id, consumed by the scheduler
    FlowEvent,
    /// Session frames leaving this member
    P2POut,
    /// Flow results for RPC callers
    FlowStatus,
    /// Off-fiber work requested by flows
    ExternalRequest,
    /// Events the processor dropped
    DeadLetter,
}

/// Lifecycle status reported to the RPC caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowRunStatus {
    /// Flow started and has not finished
    Running,
    /// Flow returned a value
    Completed,
    /// Flow raised an error
    Failed,
    /// Flow was killed
    Killed,
}

/// Status record published under the client request id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcFlowResult {
    /// Client correlation id
    pub client_request_id: String,
    /// Flow run
    pub flow_id: FlowId,
    /// Status
    pub status: FlowRunStatus,
    /// Result, for completed flows
    pub result: Option<Payload>,
    /// Error, for failed or killed flows
    pub error: Option<FlowError>,
}

/// Body of a bus record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordValue {
    /// Event for a flow
    FlowEvent(FlowEvent),

    /// Session frame and where to deliver it
    P2P {
        /// Transport address of the recipient
        address: PhysicalAddress,
        /// Frame
        message: P2PMessage,
    },

    /// Flow status for an RPC caller
    RpcFlowResult(RpcFlowResult),

    /// Off-fiber work request
    ExternalRequest {
        /// Flow waiting on the result
        flow_id: FlowId,
        /// Correlation id to answer with
        operation_id: String,
        /// Operation name
        operation: String,
        /// Operation input
        input: Payload,
    },

    /// Event the processor could not handle
    DeadLetter {
        /// Dropped event
        event: FlowEvent,
        /// Why it was dropped
        reason: String,
    },
}

/// Keyed record on a bus topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Topic
    pub topic: Topic,
    /// Partition key
    pub key: String,
    /// Body
    pub value: RecordValue,
    /// Earliest delivery instant, for delayed records
    pub deliver_at: Option<DateTime<Utc>>,
}

impl Record {
    /// Event for a flow
    pub fn flow_event(event: FlowEvent) -> Self {
        Self {
            topic: Topic::FlowEvent,
            key: event.flow_id.0.clone(),
            value: RecordValue::FlowEvent(event),
            deliver_at: None,
        }
    }

    /// Wakeup for a flow
    pub fn wakeup(flow_id: &FlowId) -> Self {
        Self::flow_event(FlowEvent::wakeup(flow_id.clone()))
    }

    /// Wakeup delivered no earlier than `at`
    pub fn delayed_wakeup(flow_id: &FlowId, at: DateTime<Utc>) -> Self {
        Self {
            deliver_at: Some(at),
            ..Self::wakeup(flow_id)
        }
    }

    /// Outbound session frame
    pub fn p2p(address: PhysicalAddress, message: P2PMessage) -> Self {
        Self {
            topic: Topic::P2POut,
            key: message.session_id.0.clone(),
            value: RecordValue::P2P { address, message },
            deliver_at: None,
        }
    }

    /// Status for an RPC caller
    pub fn rpc_result(result: RpcFlowResult) -> Self {
        Self {
            topic: Topic::FlowStatus,
            key: result.client_request_id.clone(),
            value: RecordValue::RpcFlowResult(result),
            deliver_at: None,
        }
    }

    /// Off-fiber work request
    pub fn external_request(flow_id: &FlowId, operation_id: &str, operation: &str, input: Payload) -> Self {
        Self {
            topic: Topic::ExternalRequest,
            key: operation_id.to_string(),
            value: RecordValue::ExternalRequest {
                flow_id: flow_id.clone(),
                operation_id: operation_id.to_string(),
                operation: operation.to_string(),
                input,
            },
            deliver_at: None,
        }
    }

    /// Dropped event
    pub fn dead_letter(event: FlowEvent, reason: impl Into<String>) -> Self {
        Self {
            topic: Topic::DeadLetter,
            key: event.flow_id.0.clone(),
            value: RecordValue::DeadLetter {
                event,
                reason: reason.into(),
            },
            deliver_at: None,
        }
    }
}
