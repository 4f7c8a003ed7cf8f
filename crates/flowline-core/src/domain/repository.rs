//! Collaborator interfaces for the Flowline engine
//!
//! Storage, transport and addressing are supplied by the host. The
//! in-memory implementations live in `flowline-state-inmemory`.

use async_trait::async_trait;

use super::checkpoint::Checkpoint;
use super::identity::{FlowId, MemberIdentity, PhysicalAddress};
use super::records::{Record, Topic};
use crate::CoreError;

/// Checkpoint as stored, with the version it was written at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCheckpoint {
    /// Store version, bumped on every write
    pub version: u64,

    /// Checkpoint, `None` once the flow has been tombstoned
    pub checkpoint: Option<Checkpoint>,

    /// Records written with the checkpoint and not yet acknowledged as published
    pub outbox: Vec<Record>,
}

/// Durable checkpoint storage keyed by flow id
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the current checkpoint and its version
    async fn load(&self, flow_id: &FlowId) -> Result<Option<StoredCheckpoint>, CoreError>;

    /// Compare-and-swap write.
    ///
    /// Fails with [`CoreError::VersionConflict`] unless the stored version
    /// equals `expected_version` (`None` meaning nothing stored yet). Saving
    /// `None` tombstones the flow. `outbox` replaces the stored outbox in the
    /// same write. Returns the new version.
    async fn save(
        &self,
        flow_id: &FlowId,
        expected_version: Option<u64>,
        checkpoint: Option<Checkpoint>,
        outbox: Vec<Record>,
    ) -> Result<u64, CoreError>;
}

/// Keyed, topic-based message bus
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish records in order
    async fn publish(&self, records: Vec<Record>) -> Result<(), CoreError>;

    /// Wait for the next deliverable record on a topic. `None` once the bus is closed.
    async fn consume(&self, topic: Topic) -> Result<Option<Record>, CoreError>;
}

/// Maps member identities to transport addresses
pub trait AddressResolver: Send + Sync {
    /// Resolve a member
    fn resolve(&self, member: &MemberIdentity) -> Result<PhysicalAddress, CoreError>;
}
