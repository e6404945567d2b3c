//! Room membership controller
//!
//! Owns the [`SessionContext`] and runs the engine loop: commands,
//! signaling events, transport events and timers all arrive on one mailbox
//! and are handled one at a time, to completion. Suspension happens only
//! inside awaited transport, media and relay calls; nothing else touches
//! session state while a handler runs.

use super::events::{Command, EngineEvent, EngineSnapshot, PeerSnapshot, TimerEvent};
use super::handle::EngineHandle;
use super::monitor::{DiagnosticsReport, HealthMonitor, Recommendation};
use super::negotiation::{self, scoped};
use crate::config::Config;
use crate::domain::context::SessionContext;
use crate::domain::media::{LocalMediaBundle, MediaSource, TrackKind};
use crate::domain::negotiation::NegotiationRole;
use crate::domain::session::{PeerSession, PeerSessionState, TriggerOutcome};
use crate::domain::shared::{DomainError, ParticipantId, Result, RoomId};
use crate::domain::signaling::{ConnectionState, OutboundCall, SignalingChannel, SignalingEvent};
use crate::domain::transport::{
    ConnectivityState, IceConnectionState, PeerTransportFactory, TransportEvent,
    TransportEventSink,
};
use crate::interface::metrics;
use crate::interface::status::StatusBroadcaster;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub struct RoomController {
    config: Arc<Config>,
    signaling: Arc<dyn SignalingChannel>,
    factory: Arc<dyn PeerTransportFactory>,
    media_source: Arc<dyn MediaSource>,
    status: StatusBroadcaster,
    monitor: HealthMonitor,
    ctx: SessionContext,
    tx: mpsc::UnboundedSender<EngineEvent>,
    rx: mpsc::UnboundedReceiver<EngineEvent>,
    /// Local ICE candidates are relayed in discovery order by a separate
    /// task so a slow relay never stalls the engine
    outbox: mpsc::UnboundedSender<QueuedCall>,
    outbox_rx: Option<mpsc::UnboundedReceiver<QueuedCall>>,
    recovery_pending: bool,
}

impl RoomController {
    pub fn new(
        config: Arc<Config>,
        signaling: Arc<dyn SignalingChannel>,
        factory: Arc<dyn PeerTransportFactory>,
        media_source: Arc<dyn MediaSource>,
        status: StatusBroadcaster,
    ) -> (Self, EngineHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let handle = EngineHandle::new(tx.clone(), status.clone());

        let controller = Self {
            monitor: HealthMonitor::new(config.timing.ice_restart_timeout()),
            ctx: SessionContext::new(config.signaling.display_name.clone()),
            config,
            signaling,
            factory,
            media_source,
            status,
            tx,
            rx,
            outbox,
            outbox_rx: Some(outbox_rx),
            recovery_pending: false,
        };
        (controller, handle)
    }

    /// Run the engine loop on a new task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        info!("Room controller started");

        if let Some(outbox_rx) = self.outbox_rx.take() {
            tokio::spawn(relay_outbound(
                self.signaling.clone(),
                self.status.clone(),
                outbox_rx,
            ));
        }

        let mut ticker = self.config.timing.monitor_interval().map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });

        loop {
            let event = tokio::select! {
                event = self.rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = tick(&mut ticker) => {
                    let report = self.evaluate();
                    self.act_on(&report);
                    continue;
                }
            };

            if !self.handle(event).await {
                break;
            }
        }

        info!("Room controller stopped");
    }

    /// Handle one mailbox message; returns false once the engine stops
    async fn handle(&mut self, event: EngineEvent) -> bool {
        match event {
            EngineEvent::Command(command) => return self.on_command(command).await,
            EngineEvent::Signaling(event) => self.on_signaling(event).await,
            EngineEvent::Transport {
                peer,
                generation,
                event,
            } => self.on_transport(peer, generation, event).await,
            EngineEvent::Timer(timer) => self.on_timer(timer).await,
        }
        true
    }

    async fn on_command(&mut self, command: Command) -> bool {
        match command {
            Command::JoinRoom { room, reply } => {
                let _ = reply.send(self.join_room(room).await);
            }
            Command::LeaveRoom { reply } => {
                let _ = reply.send(self.leave_room().await);
            }
            Command::Refresh { reply } => {
                let _ = reply.send(self.refresh().await);
            }
            Command::Hangup { reply } => {
                let _ = reply.send(self.hangup().await);
            }
            Command::StartMedia { reply } => {
                let _ = reply.send(self.start_media().await);
            }
            Command::Diagnose { reply } => {
                let report = self.evaluate();
                self.status.diagnostics(report.clone());
                self.act_on(&report);
                let _ = reply.send(report);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    // Room membership

    async fn join_room(&mut self, room: RoomId) -> Result<()> {
        info!("Joining room {}", room);
        self.teardown_all().await;
        self.ctx.set_current_room(room.clone());
        self.status
            .room(Some(room.clone()), format!("Joining room {}", room));

        if let Err(e) = self
            .signaling
            .invoke(OutboundCall::JoinRoom { room: room.clone() })
            .await
        {
            error!("Failed to join room {}: {}", room, e);
            self.status.error(&e);
            return Err(e);
        }
        self.status
            .room(Some(room.clone()), format!("Joined room {}", room));

        self.acquire_media().await?;
        Ok(())
    }

    async fn leave_room(&mut self) -> Result<()> {
        let room = self.ctx.clear_current_room();
        self.teardown_all().await;
        self.status.room(None, "Left room");

        let Some(room) = room else {
            debug!("Leave requested outside of a room");
            return Ok(());
        };

        info!("Leaving room {}", room);
        let call = OutboundCall::LeaveRoom {
            room: room.clone(),
            display_name: self.ctx.display_name().to_string(),
        };
        self.signaling.invoke(call).await.map_err(|e| {
            warn!("Failed to notify relay about leaving {}: {}", room, e);
            self.status.error(&e);
            e
        })
    }

    async fn refresh(&mut self) -> Result<()> {
        info!("Refreshing connection");
        self.teardown_all().await;
        self.release_media();

        let room = self
            .ctx
            .current_room()
            .cloned()
            .unwrap_or_else(|| self.config.default_room());
        self.join_room(room).await
    }

    async fn hangup(&mut self) -> Result<()> {
        info!("Hanging up");
        let left = self.leave_room().await;
        self.release_media();

        if self.config.room.rejoin_default_after_hangup {
            let joined = self.join_room(self.config.default_room()).await;
            left.and(joined)
        } else {
            left
        }
    }

    async fn shutdown(&mut self) {
        info!("Shutting down room controller");
        self.release_media();

        if let Some(room) = self.ctx.clear_current_room() {
            if self.signaling.state() == ConnectionState::Connected {
                let call = OutboundCall::LeaveRoom {
                    room,
                    display_name: self.ctx.display_name().to_string(),
                };
                if let Err(e) = self.signaling.invoke(call).await {
                    warn!("Failed to leave room during shutdown: {}", e);
                }
            }
        }
        self.teardown_all().await;
    }

    // Local media

    /// Acquire local media unless already active. Returns whether a new
    /// bundle was acquired.
    async fn acquire_media(&mut self) -> Result<bool> {
        if self.ctx.has_local_media() {
            return Ok(false);
        }

        self.status.local_media(false, "Requesting camera access...");
        let constraints = self.config.media.constraints();
        let bundle = match self.media_source.acquire(&constraints).await {
            Ok(bundle) => Arc::new(bundle),
            Err(e) => {
                let e = match e {
                    DomainError::Media(_) => e,
                    other => DomainError::Media(other.to_string()),
                };
                error!("Error accessing media devices: {}", e);
                self.status.local_media(false, format!("Error: {}", e));
                self.status.error(&e);
                return Err(e);
            }
        };

        info!(
            "Local media active: {} video / {} audio tracks",
            bundle.count(TrackKind::Video),
            bundle.count(TrackKind::Audio)
        );
        self.ctx.set_local_media(bundle.clone());
        self.status.local_media(true, "Camera active");

        let registry = self.ctx.registry_mut();
        debug!("Adding tracks to {} existing sessions", registry.len());
        for session in registry.iter_mut() {
            attach(session, &bundle, &self.status).await;
        }
        Ok(true)
    }

    /// Explicit media (re)start: acquire, attach everywhere, then call every
    /// participant we initiate toward that has no round yet
    async fn start_media(&mut self) -> Result<()> {
        if !self.acquire_media().await? {
            info!("Local media already active");
            return Ok(());
        }

        for peer in self.ctx.registry().ids() {
            let is_new = self
                .ctx
                .registry()
                .get(&peer)
                .is_some_and(|s| s.state() == PeerSessionState::New);
            if is_new && self.is_initiator(&peer) {
                self.start_outbound(&peer).await;
            }
        }
        Ok(())
    }

    fn release_media(&mut self) {
        for session in self.ctx.registry_mut().iter_mut() {
            session.detach_media();
        }
        if self.ctx.release_local_media() {
            info!("Local media released");
            self.status.local_media(false, "Camera stopped");
        }
    }

    // Session lifecycle

    /// Create a session for `peer`, destroying any existing one first.
    /// Returns the new session's generation.
    async fn create_session(&mut self, peer: &ParticipantId) -> Option<u64> {
        if let Some(old) = self.ctx.registry_mut().remove(peer) {
            info!("Replacing existing session for {}", peer);
            self.close_session(old).await;
        }

        let generation = self.ctx.next_generation();
        let tx = self.tx.clone();
        let source = peer.clone();
        let sink = TransportEventSink::new(move |event| {
            let _ = tx.send(EngineEvent::Transport {
                peer: source.clone(),
                generation,
                event,
            });
        });

        let transport = match self.factory.create(peer, sink).await {
            Ok(transport) => transport,
            Err(e) => {
                let e = DomainError::connectivity(peer, format!("failed to create transport: {}", e));
                error!("{}", e);
                self.status.error(&e);
                return None;
            }
        };

        let mut session = PeerSession::new(peer.clone(), generation, transport);
        if let Some(media) = self.ctx.local_media().cloned() {
            attach(&mut session, &media, &self.status).await;
        }
        self.ctx.registry_mut().insert(session);

        info!("Created peer session for {} (generation {})", peer, generation);
        metrics::update_active_sessions(self.ctx.registry().len());
        self.status.peer(peer, PeerSessionState::New, "Session created");
        Some(generation)
    }

    async fn close_session(&self, mut session: PeerSession) {
        let transport = session.close();
        if let Err(e) = transport.close().await {
            warn!("Error closing transport for {}: {}", session.remote(), e);
        }
        debug!("Closed peer session for {}", session.remote());
        self.status
            .peer(session.remote(), PeerSessionState::Closed, "Closed");
    }

    async fn teardown_all(&mut self) {
        let sessions = self.ctx.registry_mut().drain();
        if sessions.is_empty() {
            return;
        }
        info!("Closing {} peer sessions", sessions.len());
        for session in sessions {
            self.close_session(session).await;
        }
        metrics::update_active_sessions(0);
    }

    // Signaling events

    async fn on_signaling(&mut self, event: SignalingEvent) {
        debug!("Signaling event {}", event.name());
        match event {
            SignalingEvent::ReceiveOffer { offer, from } => self.on_offer(from, offer).await,
            SignalingEvent::ReceiveAnswer { answer, from } => self.on_answer(from, answer).await,
            SignalingEvent::ReceiveIceCandidate { candidate, from } => {
                self.on_remote_candidate(from, candidate).await
            }
            SignalingEvent::UserJoined { id, display_name } => {
                self.on_user_joined(id, display_name).await
            }
            SignalingEvent::UserLeft { id, display_name } => {
                self.on_user_left(id, display_name).await
            }
            SignalingEvent::Reconnecting { error } => {
                warn!(
                    "Signaling connection lost, reconnecting: {}",
                    error.as_deref().unwrap_or("no error")
                );
                self.status
                    .connection(ConnectionState::Reconnecting, "Reconnecting...");
            }
            SignalingEvent::Reconnected { connection_id } => {
                let id = connection_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                info!("Signaling reconnected as {}", id);
                metrics::record_signaling_reconnect();
                self.status
                    .connection(ConnectionState::Connected, format!("Reconnected as {}", id));

                if let Some(room) = self.ctx.current_room().cloned() {
                    if let Err(e) = self.join_room(room).await {
                        error!("Failed to rejoin after reconnect: {}", e);
                    }
                }
            }
            SignalingEvent::Closed { error } => {
                let e = DomainError::SignalingClosed;
                error!(
                    "Signaling connection closed: {}",
                    error.as_deref().unwrap_or("no error")
                );
                self.status.connection(
                    ConnectionState::Disconnected,
                    "Connection closed. Restart required.",
                );
                self.status.error(&e);
            }
        }
    }

    async fn on_user_joined(&mut self, peer: ParticipantId, display_name: String) {
        if self.is_self(&peer) {
            debug!("Ignoring our own join notification");
            return;
        }
        info!("User joined: {} ({})", peer, display_name);

        let Some(generation) = self.create_session(&peer).await else {
            return;
        };
        if self.ctx.has_local_media() {
            self.schedule(
                self.config.timing.setup_delay(),
                TimerEvent::SetupDelayElapsed { peer, generation },
            );
        } else {
            debug!("Local media inactive; not calling {}", peer);
        }
    }

    async fn on_user_left(&mut self, peer: ParticipantId, display_name: String) {
        match self.ctx.registry_mut().remove(&peer) {
            Some(session) => {
                info!("User left: {} ({})", peer, display_name);
                self.close_session(session).await;
                metrics::update_active_sessions(self.ctx.registry().len());
            }
            None => debug!("User left without a session: {}", peer),
        }
    }

    async fn on_offer(&mut self, from: ParticipantId, offer: String) {
        if self.is_self(&from) {
            debug!("Ignoring our own offer");
            return;
        }
        info!("Received offer from {}", from);

        if !self.ctx.registry().contains(&from) && self.create_session(&from).await.is_none() {
            return;
        }
        let initiator = self.is_initiator(&from);
        let Some(session) = self.ctx.registry_mut().get_mut(&from) else {
            return;
        };

        if session.awaiting_answer() {
            if initiator {
                info!("Ignoring offer from {} while our own offer is outstanding", from);
                self.status.peer(
                    &from,
                    session.state(),
                    "Ignored competing offer",
                );
                return;
            }
            if let Some(round) = session.round().map(|r| r.id) {
                debug!("Rolling back our round with {} to answer its offer", from);
                if let Err(e) = session.abandon_round(round) {
                    warn!("{}", e);
                }
            }
        }

        match negotiation::accept_offer(session, self.signaling.as_ref(), &offer).await {
            Ok(candidate_errors) => {
                metrics::record_answer_sent();
                self.status
                    .peer(&from, PeerSessionState::Connected, "Answer sent");
                for e in &candidate_errors {
                    self.status.error(e);
                }
                self.after_round(&from).await;
            }
            Err(e) => self.fail_round(&from, e),
        }
    }

    async fn on_answer(&mut self, from: ParticipantId, answer: String) {
        let Some(session) = self.ctx.registry_mut().get_mut(&from) else {
            let e = DomainError::NotFound(format!("answer from unknown participant {}", from));
            warn!("{}", e);
            self.status.error(&e);
            return;
        };
        info!("Received answer from {}", from);

        match negotiation::apply_answer(session, &answer).await {
            Ok(candidate_errors) => {
                self.status
                    .peer(&from, PeerSessionState::Connected, "Connected");
                for e in &candidate_errors {
                    self.status.error(e);
                }
                self.after_round(&from).await;
            }
            Err(e) => self.fail_round(&from, e),
        }
    }

    async fn on_remote_candidate(&mut self, from: ParticipantId, candidate: String) {
        let Some(session) = self.ctx.registry_mut().get_mut(&from) else {
            let e = DomainError::NotFound(format!("ICE candidate from unknown participant {}", from));
            warn!("Dropping {}", e);
            self.status.error(&e);
            return;
        };

        if let Err(e) = negotiation::add_remote_candidate(session, &candidate).await {
            warn!("Error adding ICE candidate from {}: {}", from, e);
            session.record_error(&e);
            self.status.error(&e);
        }
    }

    // Transport events

    async fn on_transport(&mut self, peer: ParticipantId, generation: u64, event: TransportEvent) {
        let live = {
            let Some(session) = self.ctx.registry_mut().get_generation_mut(&peer, generation) else {
                debug!("Ignoring transport event from stale session {} ({})", peer, generation);
                return;
            };
            session.observe(&event);
            session.liveness()
        };

        match event {
            TransportEvent::LocalCandidate(candidate) => match candidate.to_json() {
                Ok(candidate) => {
                    let call = OutboundCall::SendIceCandidate {
                        target: peer,
                        candidate,
                    };
                    if self.outbox.send(QueuedCall { call, live }).is_err() {
                        warn!("Candidate relay stopped");
                    }
                }
                Err(e) => self.status.error(&scoped(&peer, e)),
            },
            TransportEvent::CandidateGatheringComplete => {
                debug!("ICE gathering complete for {}", peer);
            }
            TransportEvent::ConnectionStateChanged(state) => {
                debug!("Connection state with {}: {}", peer, state);
                self.on_connectivity(&peer, state).await;
            }
            TransportEvent::IceConnectionStateChanged(state) => {
                debug!("ICE connection state with {}: {:?}", peer, state);
                if let Some(state) = ice_connectivity(state) {
                    self.on_connectivity(&peer, state).await;
                }
            }
            TransportEvent::SignalingStateChanged(state) => {
                debug!("Signaling state with {}: {:?}", peer, state);
            }
            TransportEvent::NegotiationNeeded => {
                debug!("Negotiation needed for {}", peer);
                self.trigger_renegotiation(&peer).await;
            }
            TransportEvent::RemoteMedia(bundle) => {
                if let Some(session) = self.ctx.registry_mut().get_mut(&peer) {
                    let message = bundle.describe();
                    info!(
                        "Remote media from {}: {} tracks on stream {}",
                        peer,
                        bundle.tracks.len(),
                        bundle.stream_id
                    );
                    session.replace_remote_media(bundle);
                    self.status.peer(&peer, session.state(), message);
                }
            }
        }
    }

    async fn on_connectivity(&mut self, peer: &ParticipantId, state: ConnectivityState) {
        let grace = self.config.timing.disconnect_grace();
        let Some(session) = self.ctx.registry_mut().get_mut(peer) else {
            return;
        };

        match state {
            ConnectivityState::Connected => {
                session.reset_recovery();
                if session.state() == PeerSessionState::Disconnected {
                    transition(session, PeerSessionState::Connected);
                    info!("Connection to {} recovered", peer);
                }
                self.status.peer(peer, session.state(), "Connected");
            }
            ConnectivityState::Disconnected => {
                if session.state() == PeerSessionState::Connected {
                    transition(session, PeerSessionState::Disconnected);
                }
                self.status.peer(peer, session.state(), "Disconnected");
                // connection and ICE level both report the same drop
                let Some(ticket) = session.arm_grace_timer() else {
                    return;
                };
                warn!("Connection to {} disconnected; recovering in {:?} unless it returns", peer, grace);
                let generation = session.generation();
                self.schedule(
                    grace,
                    TimerEvent::DisconnectGraceElapsed {
                        peer: peer.clone(),
                        generation,
                        ticket,
                    },
                );
            }
            ConnectivityState::Failed => {
                if session.state() == PeerSessionState::Connected {
                    transition(session, PeerSessionState::Disconnected);
                }
                session.disarm_grace_timer();
                let e = DomainError::connectivity(peer, "transport failed");
                error!("{}", e);
                session.record_error(&e);
                self.status.peer(peer, session.state(), "Connection failed");
                self.status.error(&e);
                self.attempt_recovery(peer).await;
            }
            _ => {}
        }
    }

    /// ICE restart once per failure episode; renegotiation when the
    /// transport cannot restart ICE. Anything beyond is the monitor's call.
    async fn attempt_recovery(&mut self, peer: &ParticipantId) {
        let initiator = self.is_initiator(peer);
        let delay = self.config.timing.renegotiate_delay();
        let Some(session) = self.ctx.registry_mut().get_mut(peer) else {
            return;
        };

        if !session.transport().supports_ice_restart() {
            if initiator {
                let Some(ticket) = session.arm_renegotiation_timer() else {
                    debug!("Renegotiation with {} already scheduled", peer);
                    return;
                };
                info!("ICE restart unavailable; renegotiating with {} in {:?}", peer, delay);
                let generation = session.generation();
                self.schedule(
                    delay,
                    TimerEvent::RenegotiateDue {
                        peer: peer.clone(),
                        generation,
                        ticket,
                    },
                );
            } else {
                info!("ICE restart unavailable; waiting for {} to renegotiate", peer);
            }
            return;
        }

        if session.recovery().ice_restart_attempts > 0 {
            info!("ICE restart already attempted for {}; leaving recovery to the monitor", peer);
            return;
        }

        session.record_ice_restart();
        if let Err(e) = session.transport().restart_ice() {
            let e = scoped(peer, e);
            error!("ICE restart with {} failed: {}", peer, e);
            session.record_error(&e);
            self.status.error(&e);
            return;
        }
        metrics::record_ice_restart();
        info!("Restarting ICE with {}", peer);
        self.status.peer(peer, session.state(), "Restarting ICE");

        if initiator {
            self.trigger_renegotiation(peer).await;
        }
    }

    // Negotiation

    async fn trigger_renegotiation(&mut self, peer: &ParticipantId) {
        if !self.is_initiator(peer) {
            debug!("Waiting for {} to initiate negotiation", peer);
            return;
        }
        let policy = self.config.negotiation.renegotiation;
        let Some(session) = self.ctx.registry_mut().get_mut(peer) else {
            return;
        };

        let state = session.state();
        match session.request_renegotiation(policy) {
            TriggerOutcome::Start => self.start_outbound(peer).await,
            TriggerOutcome::Queued => {
                info!("Round with {} in flight; renegotiation queued", peer);
            }
            TriggerOutcome::Dropped => {
                info!("Dropped renegotiation trigger for {} ({})", peer, state);
            }
        }
    }

    async fn start_outbound(&mut self, peer: &ParticipantId) {
        let Some(room) = self.ctx.current_room().cloned() else {
            let e = DomainError::negotiation(peer, "no current room to send the offer to");
            warn!("{}", e);
            self.status.error(&e);
            return;
        };
        let Some(session) = self.ctx.registry_mut().get_mut(peer) else {
            return;
        };
        let generation = session.generation();
        info!("Initiating call to {}", peer);

        match negotiation::send_offer(session, self.signaling.as_ref(), &room).await {
            Ok(round) => {
                metrics::record_offer_sent();
                self.status
                    .peer(peer, PeerSessionState::Negotiating, "Calling...");
                self.schedule(
                    self.config.timing.negotiation_timeout(),
                    TimerEvent::NegotiationTimeout {
                        peer: peer.clone(),
                        generation,
                        round,
                    },
                );
            }
            Err(e) => self.fail_round(peer, e),
        }
    }

    /// Run the queued retrigger, if the finished round left one behind
    async fn after_round(&mut self, peer: &ParticipantId) {
        let retrigger = self
            .ctx
            .registry_mut()
            .get_mut(peer)
            .is_some_and(|s| s.take_retrigger());
        if retrigger {
            info!("Running queued renegotiation with {}", peer);
            self.trigger_renegotiation(peer).await;
        }
    }

    fn fail_round(&mut self, peer: &ParticipantId, e: DomainError) {
        error!("Negotiation with {} failed: {}", peer, e);
        metrics::record_negotiation_error(e.category());
        if let Some(session) = self.ctx.registry_mut().get_mut(peer) {
            session.record_error(&e);
            self.status
                .peer(peer, session.state(), "Negotiation failed");
        }
        self.status.error(&e);
    }

    // Timers

    async fn on_timer(&mut self, timer: TimerEvent) {
        match timer {
            TimerEvent::SetupDelayElapsed { peer, generation } => {
                let has_media = self.ctx.has_local_media();
                let role = self.role(&peer);
                let Some(session) = self.ctx.registry_mut().get_generation_mut(&peer, generation) else {
                    debug!("Setup delay for stale session {}", peer);
                    return;
                };
                if session.state() != PeerSessionState::New {
                    debug!("Session with {} already {}; skipping initial call", peer, session.state());
                    return;
                }
                if !has_media {
                    debug!("Local media released; not calling {}", peer);
                    return;
                }
                match role {
                    Some(NegotiationRole::Initiator) => self.start_outbound(&peer).await,
                    Some(NegotiationRole::Responder) => {
                        debug!("Waiting for {} to send an offer", peer);
                    }
                    None => warn!("No connection id yet; cannot decide who calls {}", peer),
                }
            }
            TimerEvent::DisconnectGraceElapsed {
                peer,
                generation,
                ticket,
            } => {
                let still_down = self
                    .ctx
                    .registry_mut()
                    .get_generation_mut(&peer, generation)
                    .is_some_and(|s| {
                        s.fire_grace_timer(ticket)
                            && s.state() == PeerSessionState::Disconnected
                            && s.observed().connection != ConnectivityState::Connected
                    });
                if still_down {
                    warn!("{} still disconnected after the grace period", peer);
                    self.attempt_recovery(&peer).await;
                }
            }
            TimerEvent::RenegotiateDue {
                peer,
                generation,
                ticket,
            } => {
                if self
                    .ctx
                    .registry_mut()
                    .get_generation_mut(&peer, generation)
                    .is_some_and(|s| s.fire_renegotiation_timer(ticket))
                {
                    self.trigger_renegotiation(&peer).await;
                }
            }
            TimerEvent::NegotiationTimeout {
                peer,
                generation,
                round,
            } => {
                let timeout = self.config.timing.negotiation_timeout();
                let Some(session) = self.ctx.registry_mut().get_generation_mut(&peer, generation) else {
                    return;
                };
                if !session.is_current_round(round) || !session.awaiting_answer() {
                    return;
                }

                warn!("No answer from {} within {:?}; abandoning round {}", peer, timeout, round);
                if let Err(e) = session.abandon_round(round) {
                    warn!("{}", e);
                }
                let e = DomainError::negotiation(&peer, "no answer received in time");
                session.record_error(&e);
                metrics::record_negotiation_error(e.category());
                self.status.peer(&peer, session.state(), "Call timed out");
                self.status.error(&e);
                self.after_round(&peer).await;
            }
            TimerEvent::RecoveryDue => {
                self.recovery_pending = false;
                info!("Running full reset");
                metrics::record_full_reset();
                if let Err(e) = self.refresh().await {
                    error!("Full reset failed: {}", e);
                }
            }
        }
    }

    fn schedule(&self, delay: Duration, timer: TimerEvent) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(EngineEvent::Timer(timer));
        });
    }

    // Diagnostics

    fn evaluate(&self) -> DiagnosticsReport {
        self.monitor.evaluate(
            &self.ctx,
            self.signaling.state(),
            self.signaling.connection_id(),
        )
    }

    fn act_on(&mut self, report: &DiagnosticsReport) {
        let Some(Recommendation::FullReset { failed_peers }) = &report.recommendation else {
            return;
        };

        let auto_reset = self.config.recovery.auto_reset;
        warn!("Full reset recommended; failed sessions: {:?}", failed_peers);
        self.status
            .recovery_recommended(failed_peers.clone(), auto_reset);

        if auto_reset && !self.recovery_pending {
            self.recovery_pending = true;
            self.schedule(self.config.timing.recovery_delay(), TimerEvent::RecoveryDue);
        }
    }

    fn snapshot(&self) -> EngineSnapshot {
        let local = self.signaling.connection_id();
        let mut peers: Vec<PeerSnapshot> = self
            .ctx
            .registry()
            .iter()
            .map(|s| PeerSnapshot {
                id: s.remote().clone(),
                generation: s.generation(),
                state: s.state(),
                role: local
                    .as_ref()
                    .map(|l| NegotiationRole::for_pair(l, s.remote())),
                awaiting_answer: s.awaiting_answer(),
                pending_retrigger: s.has_pending_retrigger(),
                pending_candidates: s.pending_candidate_count(),
                remote_media: s.remote_media().cloned(),
                ice_restart_attempts: s.recovery().ice_restart_attempts,
                last_error: s.recovery().last_error.clone(),
            })
            .collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));

        EngineSnapshot {
            room: self.ctx.current_room().cloned(),
            local_id: local,
            local_media: self.ctx.local_media().map(|m| m.summary()),
            peers,
            attached_media_refs: self.ctx.registry().attached_media_count(),
        }
    }

    // Roles

    fn role(&self, peer: &ParticipantId) -> Option<NegotiationRole> {
        self.signaling
            .connection_id()
            .map(|local| NegotiationRole::for_pair(&local, peer))
    }

    fn is_initiator(&self, peer: &ParticipantId) -> bool {
        self.role(peer).is_some_and(|r| r.is_initiator())
    }

    fn is_self(&self, peer: &ParticipantId) -> bool {
        self.signaling.connection_id().as_ref() == Some(peer)
    }
}

async fn attach(session: &mut PeerSession, media: &Arc<LocalMediaBundle>, status: &StatusBroadcaster) {
    match session.transport().attach_local_media(media).await {
        Ok(()) => session.attach_media(media.clone()),
        Err(e) => {
            let e = scoped(session.remote(), e);
            warn!("Error adding tracks for {}: {}", session.remote(), e);
            session.record_error(&e);
            status.error(&e);
        }
    }
}

fn transition(session: &mut PeerSession, next: PeerSessionState) {
    if let Err(e) = session.transition_to(next) {
        warn!("Session with {}: {}", session.remote(), e);
    }
}

fn ice_connectivity(state: IceConnectionState) -> Option<ConnectivityState> {
    match state {
        IceConnectionState::Connected | IceConnectionState::Completed => {
            Some(ConnectivityState::Connected)
        }
        IceConnectionState::Disconnected => Some(ConnectivityState::Disconnected),
        IceConnectionState::Failed => Some(ConnectivityState::Failed),
        _ => None,
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Relay invocation owned by a peer session
struct QueuedCall {
    call: OutboundCall,
    live: Arc<AtomicBool>,
}

/// Relay outbound candidate invocations in order. Calls whose session was
/// closed while they waited are dropped.
async fn relay_outbound(
    signaling: Arc<dyn SignalingChannel>,
    status: StatusBroadcaster,
    mut rx: mpsc::UnboundedReceiver<QueuedCall>,
) {
    while let Some(QueuedCall { call, live }) = rx.recv().await {
        let procedure = call.procedure();
        if !live.load(Ordering::Acquire) {
            debug!("Dropping {} for a closed session", procedure);
            continue;
        }
        if let Err(e) = signaling.invoke(call).await {
            warn!("{} failed: {}", procedure, e);
            status.error(&e);
        }
    }
}
