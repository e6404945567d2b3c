//! Negotiation role coordination
//!
//! Decides which side of a participant pair opens offers. The decision is a
//! pure function of the two identifiers so both ends reach the same answer
//! without a coordination round-trip, both at initial join and on every
//! renegotiation trigger.

use super::shared::ParticipantId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Role of the local side toward one remote participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NegotiationRole {
    /// Opens offer/answer rounds
    Initiator,
    /// Only answers inbound offers
    Responder,
}

impl NegotiationRole {
    /// Role of `local` toward `remote`.
    ///
    /// `local` is the initiator iff it compares strictly less than `remote`
    /// under [`ParticipantId`]'s byte-wise ordering. Identical identifiers
    /// yield `Responder` so a client never negotiates with itself.
    pub fn for_pair(local: &ParticipantId, remote: &ParticipantId) -> Self {
        if local < remote {
            NegotiationRole::Initiator
        } else {
            NegotiationRole::Responder
        }
    }

    pub fn is_initiator(&self) -> bool {
        matches!(self, NegotiationRole::Initiator)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NegotiationRole::Initiator => "initiator",
            NegotiationRole::Responder => "responder",
        }
    }
}

impl fmt::Display for NegotiationRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do with a renegotiation trigger that arrives while a round is
/// already in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RenegotiationPolicy {
    /// Remember one pending retrigger and run it once the round settles
    #[default]
    CoalesceOne,
    /// Discard the trigger
    Drop,
}
