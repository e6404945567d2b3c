//! Offer/answer driver for one peer session
//!
//! Runs the async transport steps of a round against a session borrowed
//! from the registry. A failing step abandons the round, so the session
//! falls back to the state it was in before the round opened.

use crate::domain::session::{PeerSession, RoundDirection};
use crate::domain::shared::{DomainError, ParticipantId, Result, RoomId};
use crate::domain::signaling::{OutboundCall, SignalingChannel};
use crate::domain::transport::{IceCandidate, SdpKind, SessionDescription};
use tracing::{debug, info, warn};

/// Scope transport and payload errors to the session's participant.
/// Signaling errors keep their own category.
pub fn scoped(peer: &ParticipantId, err: DomainError) -> DomainError {
    match err {
        DomainError::Signaling(_)
        | DomainError::SignalingClosed
        | DomainError::Negotiation { .. }
        | DomainError::Connectivity { .. } => err,
        other => DomainError::negotiation(peer, other.to_string()),
    }
}

/// Outbound path: create an offer, set it locally and send it to the room.
/// The round stays open until the answer arrives; returns its id.
pub async fn send_offer(
    session: &mut PeerSession,
    signaling: &dyn SignalingChannel,
    room: &RoomId,
) -> Result<u64> {
    let peer = session.remote().clone();
    let round = session
        .begin_round(RoundDirection::Outbound)
        .map_err(|e| scoped(&peer, e))?;
    let transport = session.transport().clone();

    let result = async {
        let offer = transport.create_offer().await?;
        transport.set_local_description(offer.clone()).await?;
        let description = offer.to_json()?;
        signaling
            .invoke(OutboundCall::SendOffer {
                room: room.clone(),
                description,
            })
            .await
    }
    .await;

    match result {
        Ok(()) => {
            info!("Sent offer to {} (round {})", peer, round);
            Ok(round)
        }
        Err(e) => {
            session.abandon_round(round)?;
            Err(scoped(&peer, e))
        }
    }
}

/// Inbound path: apply the offer, flush buffered candidates, answer.
/// Candidate failures during the flush are returned alongside success.
pub async fn accept_offer(
    session: &mut PeerSession,
    signaling: &dyn SignalingChannel,
    offer_json: &str,
) -> Result<Vec<DomainError>> {
    let peer = session.remote().clone();
    let offer = SessionDescription::from_json(offer_json).map_err(|e| scoped(&peer, e))?;
    if offer.kind != SdpKind::Offer {
        return Err(DomainError::negotiation(
            &peer,
            format!("expected an offer, got {:?}", offer.kind),
        ));
    }

    let round = session
        .begin_round(RoundDirection::Inbound)
        .map_err(|e| scoped(&peer, e))?;
    let transport = session.transport().clone();

    if let Err(e) = transport.set_remote_description(offer).await {
        session.abandon_round(round)?;
        return Err(scoped(&peer, e));
    }
    let candidate_errors = flush_candidates(session).await;

    let result = async {
        let answer = transport.create_answer().await?;
        transport.set_local_description(answer.clone()).await?;
        let description = answer.to_json()?;
        signaling
            .invoke(OutboundCall::SendAnswer {
                target: peer.clone(),
                description,
            })
            .await
    }
    .await;

    match result {
        Ok(()) => {
            session.complete_round(round)?;
            info!("Sent answer to {}", peer);
            Ok(candidate_errors)
        }
        Err(e) => {
            session.abandon_round(round)?;
            Err(scoped(&peer, e))
        }
    }
}

/// Apply the answer to the outbound round in flight
pub async fn apply_answer(session: &mut PeerSession, answer_json: &str) -> Result<Vec<DomainError>> {
    let peer = session.remote().clone();
    let round = match session.round() {
        Some(round) if session.awaiting_answer() => round.id,
        _ => {
            return Err(DomainError::negotiation(
                &peer,
                format!("unexpected answer while {}", session.state()),
            ))
        }
    };

    let answer = SessionDescription::from_json(answer_json).map_err(|e| scoped(&peer, e))?;
    if answer.kind != SdpKind::Answer {
        return Err(DomainError::negotiation(
            &peer,
            format!("expected an answer, got {:?}", answer.kind),
        ));
    }

    if let Err(e) = session.transport().set_remote_description(answer).await {
        session.abandon_round(round)?;
        return Err(scoped(&peer, e));
    }
    let candidate_errors = flush_candidates(session).await;
    session.complete_round(round)?;
    info!("Applied answer from {}", peer);
    Ok(candidate_errors)
}

/// Apply a remote candidate, or buffer it until the remote description is set
pub async fn add_remote_candidate(session: &mut PeerSession, candidate_json: &str) -> Result<()> {
    let peer = session.remote().clone();
    let candidate = IceCandidate::from_json(candidate_json).map_err(|e| scoped(&peer, e))?;

    if !session.has_remote_description() {
        debug!("Buffering ICE candidate from {}", peer);
        session.buffer_candidate(candidate);
        return Ok(());
    }

    session
        .transport()
        .add_ice_candidate(candidate)
        .await
        .map_err(|e| scoped(&peer, e))
}

/// Apply buffered candidates in arrival order. One bad candidate does not
/// stop the rest.
async fn flush_candidates(session: &mut PeerSession) -> Vec<DomainError> {
    let peer = session.remote().clone();
    let pending = session.mark_remote_description_applied();
    if pending.is_empty() {
        return Vec::new();
    }

    debug!("Applying {} buffered ICE candidates from {}", pending.len(), peer);
    let transport = session.transport().clone();
    let mut errors = Vec::new();
    for candidate in pending {
        if let Err(e) = transport.add_ice_candidate(candidate).await {
            warn!("Failed to apply buffered candidate from {}: {}", peer, e);
            errors.push(scoped(&peer, e));
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::session::PeerSessionState;
    use crate::domain::signaling::MockSignalingChannel;
    use crate::domain::transport::MockPeerTransport;
    use mockall::predicate::*;
    use mockall::Sequence;
    use std::sync::Arc;

    const OFFER: &str = r#"{"type":"offer","sdp":"v=0 offer"}"#;
    const ANSWER: &str = r#"{"type":"answer","sdp":"v=0 answer"}"#;
    const CANDIDATE: &str = r#"{"candidate":"candidate:1 1 udp 1 10.0.0.1 9 typ host","sdpMid":"0","sdpMLineIndex":0}"#;

    fn session(transport: MockPeerTransport) -> PeerSession {
        PeerSession::new(ParticipantId::new("p3"), 1, Arc::new(transport))
    }

    #[tokio::test]
    async fn test_accept_offer_sends_exactly_one_answer() {
        let mut transport = MockPeerTransport::new();
        transport
            .expect_set_remote_description()
            .times(1)
            .returning(|_| Ok(()));
        transport
            .expect_create_answer()
            .times(1)
            .returning(|| Ok(SessionDescription::answer("v=0 answer")));
        transport
            .expect_set_local_description()
            .times(1)
            .returning(|_| Ok(()));

        let mut signaling = MockSignalingChannel::new();
        signaling
            .expect_invoke()
            .withf(|call| {
                matches!(call, OutboundCall::SendAnswer { target, .. } if target.as_str() == "p3")
            })
            .times(1)
            .returning(|_| Ok(()));

        let mut s = session(transport);
        let errors = accept_offer(&mut s, &signaling, OFFER).await.unwrap();
        assert!(errors.is_empty());
        assert_eq!(s.state(), PeerSessionState::Connected);
    }

    #[tokio::test]
    async fn test_buffered_candidates_follow_remote_description() {
        let mut seq = Sequence::new();
        let mut transport = MockPeerTransport::new();
        transport
            .expect_set_remote_description()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        transport
            .expect_add_ice_candidate()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        transport
            .expect_create_answer()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(SessionDescription::answer("v=0 answer")));
        transport
            .expect_set_local_description()
            .returning(|_| Ok(()));

        let mut signaling = MockSignalingChannel::new();
        signaling.expect_invoke().returning(|_| Ok(()));

        let mut s = session(transport);
        add_remote_candidate(&mut s, CANDIDATE).await.unwrap();
        add_remote_candidate(&mut s, CANDIDATE).await.unwrap();
        assert_eq!(s.pending_candidate_count(), 2);

        accept_offer(&mut s, &signaling, OFFER).await.unwrap();
        assert_eq!(s.pending_candidate_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_remote_description_keeps_prior_state() {
        let mut transport = MockPeerTransport::new();
        transport
            .expect_set_remote_description()
            .returning(|_| Err(DomainError::InvalidPayload("bad sdp".into())));
        transport.expect_add_ice_candidate().never();

        let signaling = MockSignalingChannel::new();
        let mut s = session(transport);
        add_remote_candidate(&mut s, CANDIDATE).await.unwrap();

        let err = accept_offer(&mut s, &signaling, OFFER).await.unwrap_err();
        assert!(matches!(err, DomainError::Negotiation { .. }));
        assert_eq!(s.state(), PeerSessionState::New);
        assert_eq!(s.pending_candidate_count(), 1);
    }

    #[tokio::test]
    async fn test_send_offer_then_answer() {
        let mut transport = MockPeerTransport::new();
        transport
            .expect_create_offer()
            .times(1)
            .returning(|| Ok(SessionDescription::offer("v=0 offer")));
        transport
            .expect_set_local_description()
            .times(1)
            .returning(|_| Ok(()));
        transport
            .expect_set_remote_description()
            .with(eq(SessionDescription::answer("v=0 answer")))
            .times(1)
            .returning(|_| Ok(()));

        let mut signaling = MockSignalingChannel::new();
        signaling
            .expect_invoke()
            .withf(|call| matches!(call, OutboundCall::SendOffer { room, .. } if room.as_str() == "room_123"))
            .times(1)
            .returning(|_| Ok(()));

        let mut s = session(transport);
        send_offer(&mut s, &signaling, &RoomId::new("room_123"))
            .await
            .unwrap();
        assert!(s.awaiting_answer());

        apply_answer(&mut s, ANSWER).await.unwrap();
        assert_eq!(s.state(), PeerSessionState::Connected);
    }

    #[tokio::test]
    async fn test_failed_send_abandons_round() {
        let mut transport = MockPeerTransport::new();
        transport
            .expect_create_offer()
            .returning(|| Ok(SessionDescription::offer("v=0")));
        transport
            .expect_set_local_description()
            .returning(|_| Ok(()));

        let mut signaling = MockSignalingChannel::new();
        signaling
            .expect_invoke()
            .returning(|_| Err(DomainError::Signaling("relay unreachable".into())));

        let mut s = session(transport);
        let err = send_offer(&mut s, &signaling, &RoomId::new("r"))
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Signaling(_)));
        assert_eq!(s.state(), PeerSessionState::New);
        assert!(s.round().is_none());
    }

    #[tokio::test]
    async fn test_unexpected_answer_is_rejected() {
        let mut transport = MockPeerTransport::new();
        transport.expect_set_remote_description().never();

        let mut s = session(transport);
        let err = apply_answer(&mut s, ANSWER).await.unwrap_err();
        assert!(matches!(err, DomainError::Negotiation { .. }));
    }
}
