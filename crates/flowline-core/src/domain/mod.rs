/// Flow, session and member identities
pub mod identity;

/// Session state owned by a flow
pub mod session;

/// Subflow call stack
pub mod flow_stack;

/// Bus-level events and session frames
pub mod events;

/// Suspension requests and their matching against buffered events
pub mod io_request;

/// Checkpoint and flow state
pub mod checkpoint;

/// Bus records the engine produces
pub mod records;

/// Collaborator interfaces
pub mod repository;
