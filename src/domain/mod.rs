//! Domain layer - session model and the ports the engine drives
//!
//! This layer contains:
//! - Value objects: participant, room and session identifiers
//! - The peer session aggregate and its state machine
//! - The session registry and session context
//! - Negotiation role computation
//! - Ports: signaling channel, peer transport, media source

pub mod context;
pub mod media;
pub mod negotiation;
pub mod registry;
pub mod session;
pub mod shared;
pub mod signaling;
pub mod transport;

// Re-export commonly used types
pub use shared::{DomainError, Result};
