/// Replay journal and its serialization
pub mod continuation;

/// Flow logic trait and the fiber that drives it
pub mod fiber;

/// Flow type registry
pub mod registry;

/// Records emitted for parked requests
pub mod requests;

/// Completion, failure and kill
pub mod teardown;

/// Event pipeline stages
pub mod pipeline;

/// Per-kind event handlers
pub mod handlers;

/// Event processor
pub mod processor;

/// Per-flow sequential scheduling over the bus
pub mod scheduler;
