//! Shared fakes for engine integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use meshcall::application::{EngineSnapshot, RoomController};
use meshcall::config::Config;
use meshcall::domain::media::{
    LocalMediaBundle, LocalTrack, MediaConstraints, MediaSource, TrackKind,
};
use meshcall::domain::shared::{DomainError, ParticipantId, Result};
use meshcall::domain::signaling::{ConnectionState, OutboundCall, SignalingChannel, SignalingEvent};
use meshcall::domain::transport::{
    IceCandidate, PeerTransport, PeerTransportFactory, SessionDescription, TransportEvent,
    TransportEventSink, TransportStates,
};
use meshcall::interface::{StatusBroadcaster, StatusEvent};
use meshcall::EngineHandle;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub const OFFER: &str = r#"{"type":"offer","sdp":"v=0 remote offer"}"#;
pub const ANSWER: &str = r#"{"type":"answer","sdp":"v=0 remote answer"}"#;

pub fn candidate(n: u32) -> String {
    format!(
        r#"{{"candidate":"candidate:{} 1 udp 2122260223 10.0.0.{} 5000 typ host","sdpMid":"0","sdpMLineIndex":0}}"#,
        n, n
    )
}

// Signaling

pub struct FakeSignaling {
    calls: Mutex<Vec<OutboundCall>>,
    connection_id: Mutex<Option<ParticipantId>>,
    state: Mutex<ConnectionState>,
    failing: Mutex<HashSet<&'static str>>,
}

impl FakeSignaling {
    pub fn new(local: &str) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            connection_id: Mutex::new(Some(ParticipantId::new(local))),
            state: Mutex::new(ConnectionState::Connected),
            failing: Mutex::new(HashSet::new()),
        }
    }

    /// Make every invocation of `procedure` fail
    pub fn fail(&self, procedure: &'static str) {
        self.failing.lock().insert(procedure);
    }

    pub fn recover(&self, procedure: &'static str) {
        self.failing.lock().remove(procedure);
    }

    pub fn set_connection_id(&self, id: &str) {
        *self.connection_id.lock() = Some(ParticipantId::new(id));
    }

    pub fn calls(&self) -> Vec<OutboundCall> {
        self.calls.lock().clone()
    }

    pub fn count(&self, procedure: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.procedure() == procedure)
            .count()
    }

    pub fn answers_to(&self, target: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, OutboundCall::SendAnswer { target: t, .. } if t.as_str() == target))
            .count()
    }

    pub fn candidates_to(&self, target: &str) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                OutboundCall::SendIceCandidate { target: t, candidate } if t.as_str() == target => {
                    Some(candidate.clone())
                }
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl SignalingChannel for FakeSignaling {
    async fn invoke(&self, call: OutboundCall) -> Result<()> {
        let procedure = call.procedure();
        self.calls.lock().push(call);
        if self.failing.lock().contains(procedure) {
            return Err(DomainError::Signaling(format!("{} rejected by relay", procedure)));
        }
        Ok(())
    }

    fn connection_id(&self) -> Option<ParticipantId> {
        self.connection_id.lock().clone()
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }
}

// Transport

pub struct FakeTransport {
    ops: Mutex<Vec<String>>,
    states: Mutex<TransportStates>,
    supports_restart: bool,
    offers: AtomicUsize,
    closed: AtomicBool,
    reject_remote: AtomicBool,
}

impl FakeTransport {
    fn new(supports_restart: bool) -> Self {
        Self {
            ops: Mutex::new(Vec::new()),
            states: Mutex::new(TransportStates::default()),
            supports_restart,
            offers: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            reject_remote: AtomicBool::new(false),
        }
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.ops.lock().iter().filter(|o| o.starts_with(op)).count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn set_states(&self, states: TransportStates) {
        *self.states.lock() = states;
    }

    pub fn reject_remote_descriptions(&self) {
        self.reject_remote.store(true, Ordering::SeqCst);
    }

    fn log(&self, op: impl Into<String>) {
        self.ops.lock().push(op.into());
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn attach_local_media(&self, media: &LocalMediaBundle) -> Result<()> {
        self.log(format!("attach:{}", media.tracks().len()));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let n = self.offers.fetch_add(1, Ordering::SeqCst);
        self.log("create_offer");
        Ok(SessionDescription::offer(format!("v=0 local offer {}", n)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.log("create_answer");
        Ok(SessionDescription::answer("v=0 local answer"))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.log(format!("set_local:{:?}", description.kind));
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.log(format!("set_remote:{:?}", description.kind));
        if self.reject_remote.load(Ordering::SeqCst) {
            return Err(DomainError::InvalidPayload("unparseable SDP".to_string()));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.log(format!("add_candidate:{}", candidate.candidate));
        Ok(())
    }

    fn supports_ice_restart(&self) -> bool {
        self.supports_restart
    }

    fn restart_ice(&self) -> Result<()> {
        self.log("restart_ice");
        Ok(())
    }

    fn states(&self) -> TransportStates {
        *self.states.lock()
    }

    async fn close(&self) -> Result<()> {
        self.log("close");
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct Created {
    pub peer: ParticipantId,
    pub transport: Arc<FakeTransport>,
    pub sink: TransportEventSink,
}

#[derive(Default)]
pub struct FakeTransportFactory {
    created: Mutex<Vec<Created>>,
    no_restart: AtomicBool,
}

impl FakeTransportFactory {
    /// Transports created from now on cannot restart ICE
    pub fn without_ice_restart(&self) {
        self.no_restart.store(true, Ordering::SeqCst);
    }

    pub fn created_for(&self, peer: &str) -> usize {
        self.created
            .lock()
            .iter()
            .filter(|c| c.peer.as_str() == peer)
            .count()
    }

    /// Every transport created for `peer`, oldest first
    pub fn transports(&self, peer: &str) -> Vec<Arc<FakeTransport>> {
        self.created
            .lock()
            .iter()
            .filter(|c| c.peer.as_str() == peer)
            .map(|c| c.transport.clone())
            .collect()
    }

    pub fn latest(&self, peer: &str) -> Arc<FakeTransport> {
        match self.transports(peer).pop() {
            Some(t) => t,
            None => panic!("no transport created for {}", peer),
        }
    }

    /// Emit an event from the latest transport of `peer`
    pub fn emit(&self, peer: &str, event: TransportEvent) {
        let sink = self
            .created
            .lock()
            .iter()
            .rev()
            .find(|c| c.peer.as_str() == peer)
            .map(|c| c.sink.clone());
        match sink {
            Some(sink) => sink.emit(event),
            None => panic!("no transport created for {}", peer),
        }
    }

    /// Emit an event from the oldest transport of `peer`
    pub fn emit_from_first(&self, peer: &str, event: TransportEvent) {
        let sink = self
            .created
            .lock()
            .iter()
            .find(|c| c.peer.as_str() == peer)
            .map(|c| c.sink.clone());
        if let Some(sink) = sink {
            sink.emit(event);
        }
    }
}

#[async_trait]
impl PeerTransportFactory for FakeTransportFactory {
    async fn create(
        &self,
        remote: &ParticipantId,
        events: TransportEventSink,
    ) -> Result<Arc<dyn PeerTransport>> {
        let transport = Arc::new(FakeTransport::new(!self.no_restart.load(Ordering::SeqCst)));
        self.created.lock().push(Created {
            peer: remote.clone(),
            transport: transport.clone(),
            sink: events,
        });
        Ok(transport)
    }
}

// Media

#[derive(Debug)]
pub struct FakeTrack {
    id: String,
    kind: TrackKind,
    stopped: AtomicBool,
}

impl FakeTrack {
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl LocalTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Default)]
pub struct FakeMediaSource {
    acquired: AtomicUsize,
    failing: AtomicBool,
    tracks: Mutex<Vec<Arc<FakeTrack>>>,
}

impl FakeMediaSource {
    pub fn acquisitions(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn recover(&self) {
        self.failing.store(false, Ordering::SeqCst);
    }

    pub fn all_stopped(&self) -> bool {
        self.tracks.lock().iter().all(|t| t.is_stopped())
    }
}

#[async_trait]
impl MediaSource for FakeMediaSource {
    async fn acquire(&self, _constraints: &MediaConstraints) -> Result<LocalMediaBundle> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DomainError::Media("camera permission denied".to_string()));
        }
        let n = self.acquired.fetch_add(1, Ordering::SeqCst);
        let video = Arc::new(FakeTrack {
            id: format!("video-{}", n),
            kind: TrackKind::Video,
            stopped: AtomicBool::new(false),
        });
        let audio = Arc::new(FakeTrack {
            id: format!("audio-{}", n),
            kind: TrackKind::Audio,
            stopped: AtomicBool::new(false),
        });
        self.tracks.lock().extend([video.clone(), audio.clone()]);

        let tracks: Vec<Arc<dyn LocalTrack>> = vec![video, audio];
        Ok(LocalMediaBundle::new(format!("stream-{}", n), tracks, None))
    }
}

// Harness

pub struct Harness {
    pub engine: EngineHandle,
    pub signaling: Arc<FakeSignaling>,
    pub factory: Arc<FakeTransportFactory>,
    pub media: Arc<FakeMediaSource>,
    pub status: StatusBroadcaster,
    pub task: JoinHandle<()>,
}

/// Test configuration: no periodic monitor, round numbers for timers
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.timing.setup_delay_ms = 1000;
    config.timing.disconnect_grace_ms = 2000;
    config.timing.renegotiate_delay_ms = 1000;
    config.timing.negotiation_timeout_ms = 10_000;
    config.timing.ice_restart_timeout_ms = 5000;
    config.timing.recovery_delay_ms = 1000;
    config.timing.monitor_interval_ms = 0;
    config
}

pub fn setup_engine(local: &str, config: Config) -> Harness {
    let signaling = Arc::new(FakeSignaling::new(local));
    let factory = Arc::new(FakeTransportFactory::default());
    let media = Arc::new(FakeMediaSource::default());
    let status = StatusBroadcaster::new(256);

    let (controller, engine) = RoomController::new(
        Arc::new(config),
        signaling.clone(),
        factory.clone(),
        media.clone(),
        status.clone(),
    );
    let task = controller.spawn();

    Harness {
        engine,
        signaling,
        factory,
        media,
        status,
        task,
    }
}

impl Harness {
    /// Everything dispatched before this call has been handled once it returns
    pub async fn snapshot(&self) -> EngineSnapshot {
        self.engine.snapshot().await.unwrap()
    }

    pub fn dispatch(&self, event: SignalingEvent) {
        self.engine.dispatch(event);
    }

    pub fn user_joined(&self, id: &str) {
        self.dispatch(SignalingEvent::UserJoined {
            id: id.into(),
            display_name: format!("user {}", id),
        });
    }

    pub fn user_left(&self, id: &str) {
        self.dispatch(SignalingEvent::UserLeft {
            id: id.into(),
            display_name: format!("user {}", id),
        });
    }

    pub fn offer_from(&self, id: &str) {
        self.dispatch(SignalingEvent::ReceiveOffer {
            offer: OFFER.to_string(),
            from: id.into(),
        });
    }

    pub fn answer_from(&self, id: &str) {
        self.dispatch(SignalingEvent::ReceiveAnswer {
            answer: ANSWER.to_string(),
            from: id.into(),
        });
    }

    pub fn candidate_from(&self, id: &str, n: u32) {
        self.dispatch(SignalingEvent::ReceiveIceCandidate {
            candidate: candidate(n),
            from: id.into(),
        });
    }

    /// Join `room` and wait for the engine to settle
    pub async fn join(&self, room: &str) {
        self.engine.join_room(room.into()).await.unwrap();
    }

    /// Join as the initiator toward `peer` and complete the first round
    pub async fn connect_to(&self, peer: &str) {
        self.join("room_123").await;
        self.user_joined(peer);
        self.wait(1100).await;
        self.answer_from(peer);
        self.snapshot().await;
    }

    /// Let paused time run forward, firing any timers due in between
    pub async fn wait(&self, millis: u64) {
        tokio::time::sleep(Duration::from_millis(millis)).await;
        // one more round trip so events posted by the timers are handled
        self.snapshot().await;
    }
}

/// Every status event received so far
pub fn drain(rx: &mut broadcast::Receiver<StatusEvent>) -> Vec<StatusEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn error_categories(events: &[StatusEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            StatusEvent::Error { category, .. } => Some(category.clone()),
            _ => None,
        })
        .collect()
}
