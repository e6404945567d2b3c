//! Application layer - the session-orchestration engine
//!
//! This layer drives the domain model:
//! - The room controller and its single mailbox event loop
//! - The offer/answer driver for individual peer sessions
//! - The diagnostics/recovery monitor
//! - The public engine handle

pub mod events;
pub mod handle;
pub mod monitor;
pub mod negotiation;
pub mod room_controller;

pub use events::{EngineSnapshot, PeerSnapshot};
pub use handle::EngineHandle;
pub use monitor::{DiagnosticsReport, HealthMonitor, PeerVerdict, Recommendation};
pub use room_controller::RoomController;
