use serde::{Deserialize, Serialize};
use std::any::Any;
use thiserror::Error;

/// Engine-level error raised while processing an event.
///
/// These never reach flow logic. The event processor turns every non-fatal
/// variant into a dropped event and keeps the prior checkpoint.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// No checkpoint exists for the flow an event was addressed to
    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    /// Flow factory could not produce a flow instance
    #[error("Flow factory error: {0}")]
    FlowFactoryError(String),

    /// Checkpoint store error
    #[error("Checkpoint store error: {0}")]
    CheckpointStoreError(String),

    /// Checkpoint was modified by another writer
    #[error("Checkpoint version conflict for flow {flow_id}: expected {expected:?}, found {actual:?}")]
    VersionConflict {
        /// Flow whose checkpoint changed underneath us
        flow_id: String,
        /// Version the writer loaded
        expected: Option<u64>,
        /// Version currently stored
        actual: Option<u64>,
    },

    /// Message bus error
    #[error("Message bus error: {0}")]
    BusError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Replayed flow logic diverged from its journal
    #[error("Non-deterministic replay: {0}")]
    NonDeterministicReplay(String),

    /// Flow awaited something the engine does not drive
    #[error("Flow execution error: {0}")]
    FlowExecutionError(String),

    /// Event is malformed or not applicable to the flow's current state
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Address resolution error
    #[error("Address resolution error: {0}")]
    AddressResolutionError(String),

    /// Configuration error. Fatal: the engine stops.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Unrecoverable engine fault. Fatal: the engine stops.
    #[error("Fatal engine fault: {0}")]
    Fatal(String),
}

impl CoreError {
    /// Whether this error must stop the engine instead of dropping the event
    pub fn is_fatal(&self) -> bool {
        matches!(self, CoreError::ConfigurationError(_) | CoreError::Fatal(_))
    }

    /// Fatal error for a caught panic
    pub fn from_panic(context: &str, panic: Box<dyn Any + Send>) -> Self {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        CoreError::Fatal(format!("{} panicked: {}", context, message))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

/// Error visible to flow logic.
///
/// Flow errors are journaled, so replay raises the same error at the same
/// call site.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowError {
    /// Counterparty flow failed and reported it over the session
    #[error("Counterparty flow on session {session_id} failed: {message}")]
    RemoteError {
        /// Session the error arrived on
        session_id: String,
        /// Error reported by the counterparty
        message: String,
    },

    /// Session was closed locally
    #[error("Session {0} is closed")]
    SessionClosed(String),

    /// Counterparty closed the session
    #[error("Session {0} was closed by the counterparty")]
    SessionClosedByPeer(String),

    /// Session id is not registered on this flow
    #[error("Unknown session: {0}")]
    UnknownSession(String),

    /// Session initiated outside an initiating flow
    #[error("Flow {0} cannot initiate sessions: no initiating flow on the stack")]
    NotInitiating(String),

    /// Off-fiber operation reported failure
    #[error("Async operation {operation_id} failed: {message}")]
    AsyncOperationFailed {
        /// Operation that failed
        operation_id: String,
        /// Failure reported by the executor
        message: String,
    },

    /// Payload could not be encoded or decoded
    #[error("Payload serialization error: {0}")]
    Serialization(String),

    /// Flow was killed
    #[error("Flow killed: {0}")]
    Killed(String),

    /// Business logic failure raised by the flow itself
    #[error("{0}")]
    Failed(String),
}

impl From<serde_json::Error> for FlowError {
    fn from(err: serde_json::Error) -> Self {
        FlowError::Serialization(err.to_string())
    }
}

impl From<String> for FlowError {
    fn from(err: String) -> Self {
        FlowError::Failed(err)
    }
}

impl From<&str> for FlowError {
    fn from(err: &str) -> Self {
        FlowError::Failed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_error_display() {
        let errors = vec![
            (CoreError::FlowNotFound("f1".to_string()), "Flow not found: f1"),
            (CoreError::FlowFactoryError("x".to_string()), "Flow factory error: x"),
            (CoreError::CheckpointStoreError("db".to_string()), "Checkpoint store error: db"),
            (CoreError::BusError("bus".to_string()), "Message bus error: bus"),
            (CoreError::SerializationError("ser".to_string()), "Serialization error: ser"),
            (
                CoreError::NonDeterministicReplay("step 3".to_string()),
                "Non-deterministic replay: step 3",
            ),
            (CoreError::InvalidEvent("bad".to_string()), "Invalid event: bad"),
            (CoreError::ConfigurationError("cfg".to_string()), "Configuration error: cfg"),
            (CoreError::Fatal("oom".to_string()), "Fatal engine fault: oom"),
        ];

        for (error, expected_msg) in errors {
            assert_eq!(error.to_string(), expected_msg);
        }
    }

    #[test]
    fn test_fatal_classification() {
        assert!(CoreError::ConfigurationError("missing handler".to_string()).is_fatal());
        assert!(CoreError::Fatal("panic".to_string()).is_fatal());
        assert!(!CoreError::FlowNotFound("f".to_string()).is_fatal());
        assert!(!CoreError::VersionConflict {
            flow_id: "f".to_string(),
            expected: Some(1),
            actual: Some(2),
        }
        .is_fatal());
    }

    #[test]
    fn test_panic_payloads_become_fatal() {
        let error = CoreError::from_panic("Flow Boom", Box::new("kaboom"));
        assert_eq!(error, CoreError::Fatal("Flow Boom panicked: kaboom".to_string()));
        assert!(error.is_fatal());

        let error = CoreError::from_panic("worker", Box::new(String::from("owned")));
        assert_eq!(error, CoreError::Fatal("worker panicked: owned".to_string()));
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_error = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let error: CoreError = json_error.into();

        match error {
            CoreError::SerializationError(msg) => assert!(msg.contains("expected value")),
            _ => panic!("Expected SerializationError variant"),
        }
    }

    #[test]
    fn test_flow_error_survives_serialization() {
        let error = FlowError::RemoteError {
            session_id: "s1".to_string(),
            message: "boom".to_string(),
        };

        let json = serde_json::to_string(&error).unwrap();
        let back: FlowError = serde_json::from_str(&json).unwrap();

        assert_eq!(back, error);
        assert_eq!(back.to_string(), "Counterparty flow on session s1 failed: boom");
    }

    #[test]
    fn test_flow_error_from_str() {
        let error: FlowError = "insufficient funds".into();
        assert_eq!(error, FlowError::Failed("insufficient funds".to_string()));
    }
}
