//! Engine mailbox messages
//!
//! Everything that can change session state reaches the engine as one of
//! these messages and is handled to completion before the next one.

use super::monitor::DiagnosticsReport;
use crate::domain::media::{LocalMediaSummary, RemoteMediaBundle};
use crate::domain::negotiation::NegotiationRole;
use crate::domain::session::PeerSessionState;
use crate::domain::shared::{ParticipantId, Result, RoomId};
use crate::domain::signaling::SignalingEvent;
use crate::domain::transport::TransportEvent;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// Caller-issued operations, each with a reply channel
#[derive(Debug)]
pub enum Command {
    JoinRoom {
        room: RoomId,
        reply: oneshot::Sender<Result<()>>,
    },
    LeaveRoom {
        reply: oneshot::Sender<Result<()>>,
    },
    Refresh {
        reply: oneshot::Sender<Result<()>>,
    },
    Hangup {
        reply: oneshot::Sender<Result<()>>,
    },
    StartMedia {
        reply: oneshot::Sender<Result<()>>,
    },
    Diagnose {
        reply: oneshot::Sender<DiagnosticsReport>,
    },
    Snapshot {
        reply: oneshot::Sender<EngineSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Named heuristic timers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    /// Setup delay after a participant joined
    SetupDelayElapsed { peer: ParticipantId, generation: u64 },
    /// Grace period of a disconnected transport ran out
    DisconnectGraceElapsed {
        peer: ParticipantId,
        generation: u64,
        ticket: u64,
    },
    /// Renegotiation replacing an unavailable ICE restart
    RenegotiateDue {
        peer: ParticipantId,
        generation: u64,
        ticket: u64,
    },
    /// Outbound round `round` got no answer in time
    NegotiationTimeout {
        peer: ParticipantId,
        generation: u64,
        round: u64,
    },
    /// Scheduled full reset
    RecoveryDue,
}

#[derive(Debug)]
pub enum EngineEvent {
    Command(Command),
    Signaling(SignalingEvent),
    /// Event reported by the transport of session `generation`
    Transport {
        peer: ParticipantId,
        generation: u64,
        event: TransportEvent,
    },
    Timer(TimerEvent),
}

/// Point-in-time view of the engine state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub room: Option<RoomId>,
    pub local_id: Option<ParticipantId>,
    pub local_media: Option<LocalMediaSummary>,
    pub peers: Vec<PeerSnapshot>,
    /// Sessions still referencing the local media bundle
    pub attached_media_refs: usize,
}

impl EngineSnapshot {
    pub fn peer(&self, id: &ParticipantId) -> Option<&PeerSnapshot> {
        self.peers.iter().find(|p| &p.id == id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSnapshot {
    pub id: ParticipantId,
    pub generation: u64,
    pub state: PeerSessionState,
    pub role: Option<NegotiationRole>,
    pub awaiting_answer: bool,
    pub pending_retrigger: bool,
    pub pending_candidates: usize,
    pub remote_media: Option<RemoteMediaBundle>,
    pub ice_restart_attempts: u32,
    pub last_error: Option<String>,
}
