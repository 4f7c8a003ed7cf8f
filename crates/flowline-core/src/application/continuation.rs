//! Continuation journal.
//!
//! A flow's continuation is the ordered record of every decision it made:
//! what each suspension resumed with, which sessions it opened and which
//! subflow frames it entered and left. Resuming a flow means running its
//! logic again from the top and answering each operation from this journal
//! until the frontier is reached.

use serde::{Deserialize, Serialize};

use crate::domain::identity::SessionId;
use crate::domain::io_request::{IoRequestKind, IoResult};
use crate::error::{CoreError, FlowError};

/// One journaled decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalEntry {
    /// A suspension and what it resumed with
    Suspended {
        /// Request kind the flow suspended on
        request: IoRequestKind,
        /// Result or error handed back to the flow
        outcome: Result<IoResult, FlowError>,
    },

    /// A session was opened, or refused
    SessionOpened {
        /// Allocated session id, or the refusal
        outcome: Result<SessionId, FlowError>,
    },

    /// A flow frame was pushed
    FrameEntered {
        /// Flow type of the frame
        flow_type: String,
    },

    /// A flow frame was popped
    FrameExited {
        /// Flow type of the frame
        flow_type: String,
    },
}

impl JournalEntry {
    /// Short description for divergence errors
    pub fn describe(&self) -> String {
        match self {
            JournalEntry::Suspended { request, .. } => format!("suspend on {:?}", request),
            JournalEntry::SessionOpened { .. } => "open session".to_string(),
            JournalEntry::FrameEntered { flow_type } => format!("enter {}", flow_type),
            JournalEntry::FrameExited { flow_type } => format!("exit {}", flow_type),
        }
    }
}

/// Append-only journal of a flow run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Continuation {
    entries: Vec<JournalEntry>,
}

impl Continuation {
    /// Empty journal for a flow that has not run yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry
    pub fn push(&mut self, entry: JournalEntry) {
        self.entries.push(entry);
    }

    /// Entry at a position
    pub fn get(&self, index: usize) -> Option<&JournalEntry> {
        self.entries.get(index)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing has been journaled
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in order
    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }
}

/// Turns a journal into checkpoint bytes and back
pub trait ContinuationSerializer: Send + Sync {
    /// Encode
    fn serialize(&self, continuation: &Continuation) -> Result<Vec<u8>, CoreError>;

    /// Decode
    fn deserialize(&self, bytes: &[u8]) -> Result<Continuation, CoreError>;

    /// Decode the continuation stored on a checkpoint, empty if there is none
    fn restore(&self, bytes: Option<&[u8]>) -> Result<Continuation, CoreError> {
        match bytes {
            Some(bytes) => self.deserialize(bytes),
            None => Ok(Continuation::new()),
        }
    }
}

/// JSON encoding
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonContinuationSerializer;

impl ContinuationSerializer for JsonContinuationSerializer {
    fn serialize(&self, continuation: &Continuation) -> Result<Vec<u8>, CoreError> {
        Ok(serde_json::to_vec(continuation)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Continuation, CoreError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
