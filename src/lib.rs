//! Meshcall - peer-to-peer room calls orchestrated over a signaling relay
//!
//! Every participant of a room holds one media connection to every other
//! participant. This crate owns the orchestration around those connections:
//! room membership, offer/answer negotiation with deterministic roles,
//! ICE candidate buffering, and failure detection with ICE restart and
//! full-reset recovery. Media transport itself is delegated to the webrtc
//! crate through the [`domain::transport::PeerTransport`] port.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod interface;

// Re-export commonly used types
pub use application::{EngineHandle, RoomController};
pub use domain::shared::error::DomainError;
pub use domain::shared::result::Result;
