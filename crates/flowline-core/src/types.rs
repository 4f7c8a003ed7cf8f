use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::FlowError;

/// Opaque serialized payload carried between flows and to/from callers.
///
/// The engine never looks inside a payload. Flows encode and decode their
/// own types through the JSON helpers below.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Payload {
    /// Encoded bytes
    pub bytes: Vec<u8>,
}

impl Payload {
    /// Wrap raw bytes
    #[inline]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// An empty payload
    #[inline]
    pub fn empty() -> Self {
        Self { bytes: Vec::new() }
    }

    /// Encode a serializable value as JSON
    pub fn from_value<T>(value: &T) -> Result<Self, FlowError>
    where
        T: Serialize,
    {
        Ok(Self::new(serde_json::to_vec(value)?))
    }

    /// Encode a JSON value. Infallible because `Value` always serializes.
    pub fn json(value: serde_json::Value) -> Self {
        Self::new(value.to_string().into_bytes())
    }

    /// Decode the payload into a specific type
    pub fn to<T>(&self) -> Result<T, FlowError>
    where
        T: DeserializeOwned,
    {
        Ok(serde_json::from_slice(&self.bytes)?)
    }

    /// Decode the payload as an untyped JSON value
    pub fn to_json(&self) -> Result<serde_json::Value, FlowError> {
        self.to()
    }

    /// Raw bytes
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Whether the payload carries no bytes
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Source of the current time for the pipeline.
///
/// Sleep deadlines and delayed wakeups are evaluated against this clock.
pub trait Clock: Send + Sync {
    /// Current instant
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
