//! Peer session state machine
//!
//! New -> Negotiating -> Connected -> {Disconnected <-> Connected} -> Closed,
//! with Negotiating re-enterable from Connected and Disconnected. An
//! abandoned round rolls Negotiating back to the state it started from.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Peer session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerSessionState {
    /// Transport created, handlers wired, no round started yet
    New,
    /// Exactly one offer/answer round in flight
    Negotiating,
    /// Media flowing or expected to flow
    Connected,
    /// Connectivity degraded but not given up on
    Disconnected,
    /// Terminal
    Closed,
}

impl PeerSessionState {
    /// Check whether the machine allows moving to `next`
    pub fn can_transition_to(&self, next: PeerSessionState) -> bool {
        use PeerSessionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (New, Negotiating) => true,
            (Negotiating, Connected) => true,
            // rollback of an abandoned round
            (Negotiating, New) | (Negotiating, Disconnected) => true,
            (Connected, Disconnected) | (Connected, Negotiating) => true,
            (Disconnected, Connected) | (Disconnected, Negotiating) => true,
            _ => false,
        }
    }

    /// States from which a fresh round may be opened
    pub fn can_open_round(&self) -> bool {
        matches!(
            self,
            PeerSessionState::New | PeerSessionState::Connected | PeerSessionState::Disconnected
        )
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, PeerSessionState::Closed)
    }

    pub fn name(&self) -> &'static str {
        match self {
            PeerSessionState::New => "New",
            PeerSessionState::Negotiating => "Negotiating",
            PeerSessionState::Connected => "Connected",
            PeerSessionState::Disconnected => "Disconnected",
            PeerSessionState::Closed => "Closed",
        }
    }
}

impl fmt::Display for PeerSessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
