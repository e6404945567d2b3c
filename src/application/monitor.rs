//! Diagnostics/recovery monitor
//!
//! Samples the transport-level state of every peer session and grades it.
//! A hard failure that an ICE restart cannot fix (restart unsupported, or
//! attempted and still failed after the restart timeout) produces a
//! full-reset recommendation covering the whole room.

use crate::domain::context::SessionContext;
use crate::domain::media::{LocalMediaSummary, RemoteMediaBundle, TrackKind};
use crate::domain::negotiation::NegotiationRole;
use crate::domain::session::{PeerSession, PeerSessionState};
use crate::domain::shared::{ParticipantId, RoomId};
use crate::domain::signaling::ConnectionState;
use crate::domain::transport::{ConnectivityState, TransportStates};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Health grade of one peer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerVerdict {
    /// No round run yet
    Pending,
    Negotiating,
    Healthy,
    /// Disconnected but not failed
    Degraded,
    /// Failed, with an ICE restart pending or still within its timeout
    AwaitingIceRestart,
    /// Failed beyond what an ICE restart can repair
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerHealth {
    pub peer: ParticipantId,
    pub session_state: PeerSessionState,
    pub role: Option<NegotiationRole>,
    pub transport: TransportStates,
    pub remote_media: Option<RemoteMediaBundle>,
    pub remote_status: String,
    pub ice_restart_attempts: u32,
    pub last_error: Option<String>,
    pub verdict: PeerVerdict,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recommendation {
    /// Close and recreate every session and rejoin the active room
    FullReset { failed_peers: Vec<ParticipantId> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsReport {
    pub generated_at: DateTime<Utc>,
    pub signaling: ConnectionState,
    pub connection_id: Option<ParticipantId>,
    pub room: Option<RoomId>,
    pub local_media: Option<LocalMediaSummary>,
    pub peers: Vec<PeerHealth>,
    pub suggestions: Vec<String>,
    pub recommendation: Option<Recommendation>,
}

impl DiagnosticsReport {
    /// Whether any sampled transport is in a hard failure
    pub fn has_failure(&self) -> bool {
        self.peers.iter().any(|p| p.transport.is_failed())
    }

    pub fn peer(&self, id: &ParticipantId) -> Option<&PeerHealth> {
        self.peers.iter().find(|p| &p.peer == id)
    }
}

#[derive(Debug, Clone)]
pub struct HealthMonitor {
    ice_restart_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(ice_restart_timeout: Duration) -> Self {
        Self {
            ice_restart_timeout,
        }
    }

    /// Sample every session and build a report
    pub fn evaluate(
        &self,
        ctx: &SessionContext,
        signaling: ConnectionState,
        connection_id: Option<ParticipantId>,
    ) -> DiagnosticsReport {
        let now = Instant::now();
        let mut peers: Vec<PeerHealth> = ctx
            .registry()
            .iter()
            .map(|session| self.inspect(session, connection_id.as_ref(), now))
            .collect();
        peers.sort_by(|a, b| a.peer.cmp(&b.peer));

        let failed_peers: Vec<ParticipantId> = peers
            .iter()
            .filter(|p| p.verdict == PeerVerdict::Failed)
            .map(|p| p.peer.clone())
            .collect();
        let recommendation = if failed_peers.is_empty() {
            None
        } else {
            Some(Recommendation::FullReset { failed_peers })
        };

        let local_media = ctx.local_media().map(|m| m.summary());
        let suggestions = suggestions(signaling, local_media.is_some(), &peers);

        DiagnosticsReport {
            generated_at: Utc::now(),
            signaling,
            connection_id,
            room: ctx.current_room().cloned(),
            local_media,
            peers,
            suggestions,
            recommendation,
        }
    }

    fn inspect(
        &self,
        session: &PeerSession,
        local: Option<&ParticipantId>,
        now: Instant,
    ) -> PeerHealth {
        let transport = session.transport().states();
        let remote_status = session
            .remote_media()
            .map(|m| m.describe())
            .unwrap_or("No media tracks received")
            .to_string();

        PeerHealth {
            peer: session.remote().clone(),
            session_state: session.state(),
            role: local.map(|l| NegotiationRole::for_pair(l, session.remote())),
            transport,
            remote_media: session.remote_media().cloned(),
            remote_status,
            ice_restart_attempts: session.recovery().ice_restart_attempts,
            last_error: session.recovery().last_error.clone(),
            verdict: self.verdict(session, &transport, now),
        }
    }

    /// Grade one session from its sampled transport states
    pub fn verdict(
        &self,
        session: &PeerSession,
        transport: &TransportStates,
        now: Instant,
    ) -> PeerVerdict {
        if transport.is_failed() {
            if !session.transport().supports_ice_restart() {
                return PeerVerdict::Failed;
            }
            return match session.recovery().last_ice_restart {
                Some(at) if now.duration_since(at) >= self.ice_restart_timeout => {
                    PeerVerdict::Failed
                }
                _ => PeerVerdict::AwaitingIceRestart,
            };
        }

        match session.state() {
            PeerSessionState::New => PeerVerdict::Pending,
            PeerSessionState::Negotiating => PeerVerdict::Negotiating,
            PeerSessionState::Disconnected => PeerVerdict::Degraded,
            PeerSessionState::Connected
                if transport.connection == ConnectivityState::Disconnected =>
            {
                PeerVerdict::Degraded
            }
            PeerSessionState::Connected => PeerVerdict::Healthy,
            PeerSessionState::Closed => PeerVerdict::Failed,
        }
    }
}

fn suggestions(signaling: ConnectionState, local_media: bool, peers: &[PeerHealth]) -> Vec<String> {
    let mut out = Vec::new();

    if signaling != ConnectionState::Connected {
        out.push(format!(
            "Signaling connection is {}. Remote participants cannot be reached until it reconnects.",
            signaling
        ));
    }
    if !local_media {
        out.push("Local media is not active. Start the camera to send audio and video.".to_string());
    }
    if peers.is_empty() {
        out.push(
            "No peer connections found. Try refreshing the connection or check that another user has joined the room."
                .to_string(),
        );
    }
    for peer in peers {
        if let Some(media) = &peer.remote_media {
            if media.count(TrackKind::Audio) == 0 {
                out.push(format!(
                    "No audio tracks detected in the remote stream from {}. The sender may have disabled their microphone.",
                    peer.peer
                ));
            }
        }
    }
    if peers.iter().any(|p| p.transport.is_failed()) {
        out.push(
            "ICE connection failed. Firewalls, incompatible NAT configurations or a symmetric NAT on one side can cause this. Try a different network or add TURN servers."
                .to_string(),
        );
    }

    out
}
