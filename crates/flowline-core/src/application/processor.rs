use std::sync::Arc;
use tracing::{error, info_span};

use super::pipeline::FlowEventPipeline;
use crate::domain::checkpoint::Checkpoint;
use crate::domain::events::FlowEvent;
use crate::domain::records::Record;
use crate::error::CoreError;
use crate::types::Clock;

/// Whether the event went through the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingStatus {
    /// Pipeline ran to completion
    Processed,
    /// Processing failed; the prior checkpoint stands
    Dropped {
        /// Error that caused the drop
        reason: String,
    },
}

/// Result of processing one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorResponse {
    /// Checkpoint to store
    pub checkpoint: Option<Checkpoint>,
    /// Records to publish
    pub records: Vec<Record>,
    /// Outcome
    pub status: ProcessingStatus,
}

/// Runs the pipeline for one event and contains processing errors
pub struct EventProcessor {
    pipeline: FlowEventPipeline,
    clock: Arc<dyn Clock>,
}

impl EventProcessor {
    /// Create a processor
    pub fn new(pipeline: FlowEventPipeline, clock: Arc<dyn Clock>) -> Self {
        Self { pipeline, clock }
    }

    /// Process one event against the flow's current checkpoint.
    ///
    /// Non-fatal errors are logged and produce a dropped response carrying
    /// the unmodified checkpoint and no records. Fatal errors are returned.
    pub fn on_next(&self, checkpoint: Option<Checkpoint>, event: FlowEvent) -> Result<ProcessorResponse, CoreError> {
        let span = info_span!(
            "flow_event",
            flow_id = %event.flow_id,
            kind = event.kind().event_type()
        );
        let _enter = span.enter();

        match self.pipeline.execute(checkpoint.clone(), event, self.clock.now()) {
            Ok(response) => Ok(ProcessorResponse {
                checkpoint: response.checkpoint,
                records: response.records,
                status: ProcessingStatus::Processed,
            }),
            Err(e) if e.is_fatal() => {
                error!("Fatal error while processing event: {}", e);
                Err(e)
            }
            Err(e) => {
                error!("Dropping event: {}", e);
                Ok(ProcessorResponse {
                    checkpoint,
                    records: Vec::new(),
                    status: ProcessingStatus::Dropped { reason: e.to_string() },
                })
            }
        }
    }
}
