//! Peer session model

pub mod peer_session;
pub mod state;

pub use peer_session::{NegotiationRound, PeerSession, RecoveryState, RoundDirection, TriggerOutcome};
pub use state::PeerSessionState;
