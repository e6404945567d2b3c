//! Interface layer - what the engine exposes to its surroundings
//!
//! This layer handles:
//! - The status event stream
//! - Console rendering of status events
//! - Prometheus metrics

pub mod console;
pub mod metrics;
pub mod status;

pub use status::{StatusBroadcaster, StatusEvent};
