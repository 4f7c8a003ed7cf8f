//! Testing utilities for the flowline engine.
//!
//! Sample flows covering every suspension request, a manually driven clock,
//! and an in-process network that pumps records between members.

pub mod clock;
pub mod flows;
pub mod network;

pub use clock::ManualClock;
pub use flows::sample_registry;
pub use network::{TestNetwork, TestNode};
