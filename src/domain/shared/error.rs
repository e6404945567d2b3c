//! Domain errors

use super::value_objects::ParticipantId;
use thiserror::Error;

/// Errors surfaced by the session-orchestration core.
///
/// The first five variants follow the failure taxonomy the engine reports on:
/// relay problems, media acquisition, per-session negotiation, connectivity,
/// and a terminally closed signaling channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Signaling connection closed")]
    SignalingClosed,

    #[error("Media error: {0}")]
    Media(String),

    #[error("Negotiation error with {peer}: {message}")]
    Negotiation { peer: ParticipantId, message: String },

    #[error("Connectivity failure with {peer}: {message}")]
    Connectivity { peer: ParticipantId, message: String },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Engine stopped")]
    EngineStopped,
}

impl DomainError {
    pub fn negotiation(peer: &ParticipantId, message: impl Into<String>) -> Self {
        DomainError::Negotiation {
            peer: peer.clone(),
            message: message.into(),
        }
    }

    pub fn connectivity(peer: &ParticipantId, message: impl Into<String>) -> Self {
        DomainError::Connectivity {
            peer: peer.clone(),
            message: message.into(),
        }
    }

    /// Short category name used in status events and metric labels
    pub fn category(&self) -> &'static str {
        match self {
            DomainError::Signaling(_) | DomainError::SignalingClosed => "signaling",
            DomainError::Media(_) => "media",
            DomainError::Negotiation { .. } => "negotiation",
            DomainError::InvalidPayload(_) => "invalid_payload",
            DomainError::Connectivity { .. } => "connectivity",
            DomainError::InvalidStateTransition { .. } => "state",
            DomainError::NotFound(_) => "not_found",
            DomainError::Config(_) => "config",
            DomainError::EngineStopped => "engine",
        }
    }

    /// Participant the error is scoped to, if any
    pub fn peer(&self) -> Option<&ParticipantId> {
        match self {
            DomainError::Negotiation { peer, .. } | DomainError::Connectivity { peer, .. } => {
                Some(peer)
            }
            _ => None,
        }
    }

    /// Whether the error is scoped to a single peer session
    pub fn is_session_scoped(&self) -> bool {
        matches!(
            self,
            DomainError::Negotiation { .. } | DomainError::Connectivity { .. }
        )
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::InvalidPayload(err.to_string())
    }
}
