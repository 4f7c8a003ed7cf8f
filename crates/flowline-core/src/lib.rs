//!
//! Flowline Core - durable, resumable flow engine
//!
//! Flows are long-running pieces of logic that talk to flows on other
//! members over sessions. A flow suspends whenever it needs something from
//! the outside world; the engine checkpoints it, publishes the records the
//! suspension implies, and resumes it by replay when a matching event
//! arrives.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - identities, sessions, events, checkpoints
pub mod domain;

/// Application services - fiber, pipeline, processor, scheduler
pub mod application;

/// Core types and traits
pub mod types;

/// Error types
pub mod error;

/// Engine configuration
pub mod config;

/// Tracing setup
pub mod logging;

pub use error::{CoreError, FlowError};
pub use types::{Clock, Payload, SystemClock};

pub use application::continuation::{Continuation, ContinuationSerializer, JsonContinuationSerializer};
pub use application::fiber::{FlowContext, FlowLogic};
pub use application::pipeline::FlowEventPipeline;
pub use application::processor::{EventProcessor, ProcessingStatus, ProcessorResponse};
pub use application::registry::{FlowFactory, FlowRegistry};
pub use application::scheduler::FlowScheduler;
pub use config::{EngineConfig, LoggingConfig};
pub use logging::init_logging;

pub use domain::checkpoint::{Checkpoint, FlowState};
pub use domain::events::{FlowEvent, FlowEventPayload, P2PMessage, SessionPayload, StartFlow};
pub use domain::identity::{FlowId, MemberIdentity, PhysicalAddress, SessionId};
pub use domain::io_request::{IoRequest, IoResult};
pub use domain::records::{FlowRunStatus, Record, RecordValue, RpcFlowResult, Topic};
pub use domain::repository::{AddressResolver, CheckpointStore, MessageBus, StoredCheckpoint};
