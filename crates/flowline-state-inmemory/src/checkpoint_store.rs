use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use flowline_core::{Checkpoint, CheckpointStore, CoreError, FlowId, Record, StoredCheckpoint};

/// In-memory implementation of the CheckpointStore.
///
/// Every save bumps the flow's version. A save of `None` keeps a tombstone
/// entry so events for finished flows can be told apart from events for
/// flows that never existed.
#[derive(Clone, Default)]
pub struct InMemoryCheckpointStore {
    entries: Arc<RwLock<HashMap<FlowId, StoredCheckpoint>>>,
}

impl InMemoryCheckpointStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Flows with a live (non-tombstoned) checkpoint
    pub async fn live_flows(&self) -> Vec<FlowId> {
        let entries = self.entries.read().await;
        let mut flows: Vec<FlowId> = entries
            .iter()
            .filter(|(_, stored)| stored.checkpoint.is_some())
            .map(|(flow_id, _)| flow_id.clone())
            .collect();
        flows.sort();
        flows
    }

    /// Records stored for a flow and not yet acknowledged
    pub async fn pending_outbox(&self, flow_id: &FlowId) -> Vec<Record> {
        let entries = self.entries.read().await;
        entries.get(flow_id).map(|stored| stored.outbox.clone()).unwrap_or_default()
    }

    /// Whether the flow ran and finished
    pub async fn is_tombstoned(&self, flow_id: &FlowId) -> bool {
        let entries = self.entries.read().await;
        matches!(entries.get(flow_id), Some(stored) if stored.checkpoint.is_none())
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, flow_id: &FlowId) -> Result<Option<StoredCheckpoint>, CoreError> {
        let entries = self.entries.read().await;
        Ok(entries.get(flow_id).cloned())
    }

    async fn save(
        &self,
        flow_id: &FlowId,
        expected_version: Option<u64>,
        checkpoint: Option<Checkpoint>,
        outbox: Vec<Record>,
    ) -> Result<u64, CoreError> {
        let mut entries = self.entries.write().await;
        let current = entries.get(flow_id).map(|stored| stored.version);

        if current != expected_version {
            return Err(CoreError::VersionConflict {
                flow_id: flow_id.0.clone(),
                expected: expected_version,
                actual: current,
            });
        }

        let version = current.unwrap_or(0) + 1;
        debug!(
            flow_id = %flow_id,
            version,
            tombstone = checkpoint.is_none(),
            outbox = outbox.len(),
            "Storing checkpoint"
        );
        entries.insert(
            flow_id.clone(),
            StoredCheckpoint {
                version,
                checkpoint,
                outbox,
            },
        );
        Ok(version)
    }
}
