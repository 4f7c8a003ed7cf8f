//! In-memory collaborators for the flowline engine
//!
//! This crate provides in-memory implementations of the checkpoint store,
//! message bus and address resolver interfaces defined in flowline-core,
//! plus the session router that maps inbound session frames to flows. It is
//! primarily useful for development, testing and single-process deployments
//! where persistence is not required.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Compare-and-swap checkpoint store
pub mod checkpoint_store;

/// Topic queues with delayed delivery
pub mod bus;

/// Session frame to flow mapping
pub mod router;

/// Member to address table
pub mod resolver;

pub use bus::InMemoryMessageBus;
pub use checkpoint_store::InMemoryCheckpointStore;
pub use resolver::StaticAddressResolver;
pub use router::LoopbackSessionRouter;
