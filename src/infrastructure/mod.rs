//! Infrastructure layer - Technical implementations
//!
//! This layer contains:
//! - The signaling relay client (SignalR hub over WebSocket)
//! - The webrtc-backed peer transport and media source

pub mod signaling;
pub mod webrtc;
