//! Peer session aggregate
//!
//! One session per remote participant. The session owns the transport
//! handle, the negotiation round bookkeeping, the candidate buffer and the
//! recovery sub-state. Every mutation goes through methods that enforce the
//! [`PeerSessionState`] machine; the async transport calls themselves are
//! driven by the engine.

use super::state::PeerSessionState;
use crate::domain::media::{LocalMediaBundle, RemoteMediaBundle};
use crate::domain::negotiation::RenegotiationPolicy;
use crate::domain::shared::{DomainError, ParticipantId, Result, SessionId};
use crate::domain::transport::{IceCandidate, PeerTransport, TransportEvent, TransportStates};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

/// Which side opened a round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundDirection {
    /// We created the offer and wait for an answer
    Outbound,
    /// We are answering a remote offer
    Inbound,
}

/// An offer/answer round in flight
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationRound {
    pub id: u64,
    pub direction: RoundDirection,
    /// State to fall back to if the round is abandoned
    pub resume_state: PeerSessionState,
    pub started_at: Instant,
}

/// Outcome of a renegotiation trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// No round in flight; open one now
    Start,
    /// Remembered as the single pending retrigger
    Queued,
    Dropped,
}

/// Recovery bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryState {
    pub ice_restart_attempts: u32,
    pub last_ice_restart: Option<Instant>,
    pub last_error: Option<String>,
    /// Ticket of the armed disconnect grace timer
    pub grace_timer: Option<u64>,
    /// Ticket of the scheduled fallback renegotiation
    pub renegotiation_timer: Option<u64>,
}

pub struct PeerSession {
    id: SessionId,
    remote: ParticipantId,
    /// Registry generation; transport events tagged with an older
    /// generation belong to a replaced session and are ignored
    generation: u64,
    state: PeerSessionState,
    transport: Arc<dyn PeerTransport>,
    round: Option<NegotiationRound>,
    next_round_id: u64,
    pending_retrigger: bool,
    pending_candidates: Vec<IceCandidate>,
    has_remote_description: bool,
    remote_media: Option<RemoteMediaBundle>,
    attached_media: Option<Arc<LocalMediaBundle>>,
    observed: TransportStates,
    recovery: RecoveryState,
    next_ticket: u64,
    /// Cleared on close; work queued on behalf of the session checks it
    live: Arc<AtomicBool>,
    created_at: Instant,
}

impl PeerSession {
    pub fn new(remote: ParticipantId, generation: u64, transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            id: SessionId::new(),
            remote,
            generation,
            state: PeerSessionState::New,
            transport,
            round: None,
            next_round_id: 1,
            pending_retrigger: false,
            pending_candidates: Vec::new(),
            has_remote_description: false,
            remote_media: None,
            attached_media: None,
            observed: TransportStates::default(),
            recovery: RecoveryState::default(),
            next_ticket: 1,
            live: Arc::new(AtomicBool::new(true)),
            created_at: Instant::now(),
        }
    }

    /// Move to `next`, rejecting edges the state machine does not define
    pub fn transition_to(&mut self, next: PeerSessionState) -> Result<()> {
        if self.state == next {
            return Ok(());
        }
        if !self.state.can_transition_to(next) {
            return Err(DomainError::InvalidStateTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }

    /// Open a round and enter `Negotiating`. Returns the round id.
    pub fn begin_round(&mut self, direction: RoundDirection) -> Result<u64> {
        if !self.state.can_open_round() {
            return Err(DomainError::negotiation(
                &self.remote,
                format!("cannot open a round while {}", self.state),
            ));
        }
        let resume_state = self.state;
        self.transition_to(PeerSessionState::Negotiating)?;

        let id = self.next_round_id;
        self.next_round_id += 1;
        self.round = Some(NegotiationRound {
            id,
            direction,
            resume_state,
            started_at: Instant::now(),
        });
        Ok(id)
    }

    /// Finish round `id` successfully and enter `Connected`
    pub fn complete_round(&mut self, id: u64) -> Result<()> {
        self.check_round(id)?;
        self.transition_to(PeerSessionState::Connected)?;
        self.round = None;
        Ok(())
    }

    /// Drop round `id` and fall back to the state it started from
    pub fn abandon_round(&mut self, id: u64) -> Result<()> {
        let round = self.check_round(id)?.clone();
        self.transition_to(round.resume_state)?;
        self.round = None;
        Ok(())
    }

    fn check_round(&self, id: u64) -> Result<&NegotiationRound> {
        match &self.round {
            Some(round) if round.id == id => Ok(round),
            _ => Err(DomainError::negotiation(
                &self.remote,
                format!("round {} is not in flight", id),
            )),
        }
    }

    /// Whether round `id` is still the one in flight
    pub fn is_current_round(&self, id: u64) -> bool {
        self.round.as_ref().is_some_and(|r| r.id == id)
    }

    /// Whether an outbound offer is waiting for its answer
    pub fn awaiting_answer(&self) -> bool {
        matches!(
            &self.round,
            Some(NegotiationRound {
                direction: RoundDirection::Outbound,
                ..
            })
        )
    }

    /// Classify a renegotiation trigger under `policy`
    pub fn request_renegotiation(&mut self, policy: RenegotiationPolicy) -> TriggerOutcome {
        match self.state {
            PeerSessionState::Connected | PeerSessionState::Disconnected => TriggerOutcome::Start,
            PeerSessionState::Negotiating => match policy {
                RenegotiationPolicy::CoalesceOne if !self.pending_retrigger => {
                    self.pending_retrigger = true;
                    TriggerOutcome::Queued
                }
                _ => TriggerOutcome::Dropped,
            },
            PeerSessionState::New | PeerSessionState::Closed => TriggerOutcome::Dropped,
        }
    }

    /// Consume the pending retrigger, if any
    pub fn take_retrigger(&mut self) -> bool {
        std::mem::take(&mut self.pending_retrigger)
    }

    /// Hold a remote candidate until the remote description is applied
    pub fn buffer_candidate(&mut self, candidate: IceCandidate) {
        self.pending_candidates.push(candidate);
    }

    /// Record the remote description as applied and hand back the buffered
    /// candidates in arrival order
    pub fn mark_remote_description_applied(&mut self) -> Vec<IceCandidate> {
        self.has_remote_description = true;
        std::mem::take(&mut self.pending_candidates)
    }

    pub fn has_remote_description(&self) -> bool {
        self.has_remote_description
    }

    pub fn pending_candidate_count(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Last writer wins
    pub fn replace_remote_media(&mut self, bundle: RemoteMediaBundle) {
        self.remote_media = Some(bundle);
    }

    pub fn attach_media(&mut self, media: Arc<LocalMediaBundle>) {
        self.attached_media = Some(media);
    }

    pub fn detach_media(&mut self) {
        self.attached_media = None;
    }

    /// Fold a transport state event into the observed states
    pub fn observe(&mut self, event: &TransportEvent) {
        match event {
            TransportEvent::ConnectionStateChanged(s) => self.observed.connection = *s,
            TransportEvent::IceConnectionStateChanged(s) => self.observed.ice_connection = *s,
            TransportEvent::SignalingStateChanged(s) => self.observed.signaling = *s,
            TransportEvent::CandidateGatheringComplete => {
                self.observed.ice_gathering = crate::domain::transport::IceGatheringState::Complete
            }
            _ => {}
        }
    }

    pub fn record_ice_restart(&mut self) {
        self.recovery.ice_restart_attempts += 1;
        self.recovery.last_ice_restart = Some(Instant::now());
    }

    /// Connectivity recovered; the next failure may restart ICE again.
    /// Timers armed during the episode are disarmed.
    pub fn reset_recovery(&mut self) {
        self.recovery.ice_restart_attempts = 0;
        self.recovery.last_ice_restart = None;
        self.recovery.grace_timer = None;
        self.recovery.renegotiation_timer = None;
    }

    /// Arm the disconnect grace timer. `None` while one is already armed.
    pub fn arm_grace_timer(&mut self) -> Option<u64> {
        if self.recovery.grace_timer.is_some() {
            return None;
        }
        let ticket = self.issue_ticket();
        self.recovery.grace_timer = Some(ticket);
        Some(ticket)
    }

    /// Consume the grace timer; false for a disarmed or superseded ticket
    pub fn fire_grace_timer(&mut self, ticket: u64) -> bool {
        fire(&mut self.recovery.grace_timer, ticket)
    }

    pub fn disarm_grace_timer(&mut self) {
        self.recovery.grace_timer = None;
    }

    /// Schedule the fallback renegotiation. `None` while one is pending.
    pub fn arm_renegotiation_timer(&mut self) -> Option<u64> {
        if self.recovery.renegotiation_timer.is_some() {
            return None;
        }
        let ticket = self.issue_ticket();
        self.recovery.renegotiation_timer = Some(ticket);
        Some(ticket)
    }

    pub fn fire_renegotiation_timer(&mut self, ticket: u64) -> bool {
        fire(&mut self.recovery.renegotiation_timer, ticket)
    }

    fn issue_ticket(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        ticket
    }

    pub fn record_error(&mut self, error: &DomainError) {
        self.recovery.last_error = Some(error.to_string());
    }

    /// Enter `Closed`, dropping every reference the session holds except
    /// the transport, which is returned for the caller to close
    pub fn close(&mut self) -> Arc<dyn PeerTransport> {
        self.state = PeerSessionState::Closed;
        self.live.store(false, Ordering::Release);
        self.recovery.grace_timer = None;
        self.recovery.renegotiation_timer = None;
        self.round = None;
        self.pending_retrigger = false;
        self.pending_candidates.clear();
        self.remote_media = None;
        self.attached_media = None;
        self.transport.clone()
    }

    // Getters
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn remote(&self) -> &ParticipantId {
        &self.remote
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> PeerSessionState {
        self.state
    }

    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    pub fn round(&self) -> Option<&NegotiationRound> {
        self.round.as_ref()
    }

    pub fn has_pending_retrigger(&self) -> bool {
        self.pending_retrigger
    }

    pub fn remote_media(&self) -> Option<&RemoteMediaBundle> {
        self.remote_media.as_ref()
    }

    pub fn attached_media(&self) -> Option<&Arc<LocalMediaBundle>> {
        self.attached_media.as_ref()
    }

    pub fn observed(&self) -> &TransportStates {
        &self.observed
    }

    pub fn recovery(&self) -> &RecoveryState {
        &self.recovery
    }

    /// Flag that stays set until the session is closed
    pub fn liveness(&self) -> Arc<AtomicBool> {
        self.live.clone()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }
}

fn fire(slot: &mut Option<u64>, ticket: u64) -> bool {
    if *slot == Some(ticket) {
        *slot = None;
        true
    } else {
        false
    }
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("generation", &self.generation)
            .field("state", &self.state)
            .field("round", &self.round)
            .field("pending_candidates", &self.pending_candidates.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::transport::{ConnectivityState, MockPeerTransport};

    fn session() -> PeerSession {
        PeerSession::new(
            ParticipantId::new("p2"),
            1,
            Arc::new(MockPeerTransport::new()),
        )
    }

    #[test]
    fn test_outbound_round_completes_to_connected() {
        let mut s = session();
        let round = s.begin_round(RoundDirection::Outbound).unwrap();
        assert_eq!(s.state(), PeerSessionState::Negotiating);
        assert!(s.awaiting_answer());

        s.complete_round(round).unwrap();
        assert_eq!(s.state(), PeerSessionState::Connected);
        assert!(s.round().is_none());
    }

    #[test]
    fn test_only_one_round_in_flight() {
        let mut s = session();
        s.begin_round(RoundDirection::Outbound).unwrap();
        let err = s.begin_round(RoundDirection::Inbound).unwrap_err();
        assert!(matches!(err, DomainError::Negotiation { .. }));
    }

    #[test]
    fn test_abandoned_round_restores_prior_state() {
        let mut s = session();
        let first = s.begin_round(RoundDirection::Inbound).unwrap();
        s.complete_round(first).unwrap();

        let second = s.begin_round(RoundDirection::Outbound).unwrap();
        s.abandon_round(second).unwrap();
        assert_eq!(s.state(), PeerSessionState::Connected);

        let third = s.begin_round(RoundDirection::Outbound).unwrap();
        assert!(third > second);
        assert!(s.complete_round(second).is_err());
    }

    #[test]
    fn test_candidates_drain_in_arrival_order() {
        let mut s = session();
        s.buffer_candidate(IceCandidate::new("c1"));
        s.buffer_candidate(IceCandidate::new("c2"));
        assert!(!s.has_remote_description());

        let drained = s.mark_remote_description_applied();
        let names: Vec<_> = drained.iter().map(|c| c.candidate.as_str()).collect();
        assert_eq!(names, vec!["c1", "c2"]);
        assert_eq!(s.pending_candidate_count(), 0);
    }

    #[test]
    fn test_coalesce_keeps_one_retrigger() {
        let mut s = session();
        assert_eq!(
            s.request_renegotiation(RenegotiationPolicy::CoalesceOne),
            TriggerOutcome::Dropped
        );

        s.begin_round(RoundDirection::Outbound).unwrap();
        assert_eq!(
            s.request_renegotiation(RenegotiationPolicy::CoalesceOne),
            TriggerOutcome::Queued
        );
        assert_eq!(
            s.request_renegotiation(RenegotiationPolicy::CoalesceOne),
            TriggerOutcome::Dropped
        );
        assert!(s.take_retrigger());
        assert!(!s.take_retrigger());
    }

    #[test]
    fn test_drop_policy_never_queues() {
        let mut s = session();
        s.begin_round(RoundDirection::Outbound).unwrap();
        assert_eq!(
            s.request_renegotiation(RenegotiationPolicy::Drop),
            TriggerOutcome::Dropped
        );
        assert!(!s.has_pending_retrigger());
    }

    #[test]
    fn test_close_releases_references() {
        let mut s = session();
        s.replace_remote_media(RemoteMediaBundle::new("r"));
        s.attach_media(Arc::new(LocalMediaBundle::new("l", Vec::new(), None)));
        s.buffer_candidate(IceCandidate::new("c1"));
        s.observe(&TransportEvent::ConnectionStateChanged(
            ConnectivityState::Connecting,
        ));

        s.close();
        assert_eq!(s.state(), PeerSessionState::Closed);
        assert!(s.remote_media().is_none());
        assert!(s.attached_media().is_none());
        assert_eq!(s.pending_candidate_count(), 0);
        assert!(s.transition_to(PeerSessionState::Connected).is_err());
        assert!(!s.liveness().load(Ordering::Acquire));
    }

    #[test]
    fn test_recovery_timers_arm_once_per_episode() {
        let mut s = session();
        let grace = s.arm_grace_timer().unwrap();
        assert!(s.arm_grace_timer().is_none());
        let renegotiation = s.arm_renegotiation_timer().unwrap();
        assert!(s.arm_renegotiation_timer().is_none());

        assert!(s.fire_grace_timer(grace));
        assert!(!s.fire_grace_timer(grace));
        assert!(s.arm_grace_timer().is_some());
        assert!(s.fire_renegotiation_timer(renegotiation));
    }

    #[test]
    fn test_reset_recovery_disarms_stale_timers() {
        let mut s = session();
        let stale = s.arm_grace_timer().unwrap();
        s.reset_recovery();

        let fresh = s.arm_grace_timer().unwrap();
        assert_ne!(stale, fresh);
        assert!(!s.fire_grace_timer(stale));
        assert!(s.fire_grace_timer(fresh));
    }
}
