//! Peer transport on top of the webrtc crate
//!
//! One `RTCPeerConnection` per remote participant. Connection callbacks are
//! translated into [`TransportEvent`]s and pushed into the sink the engine
//! handed over at creation; the engine never sees webrtc types.

use super::convert;
use super::media::WebRtcLocalTrack;
use crate::config::IceConfig;
use crate::domain::media::{LocalMediaBundle, RemoteMediaBundle, RemoteTrackInfo, TrackKind};
use crate::domain::shared::{DomainError, ParticipantId, Result};
use crate::domain::transport::{
    IceCandidate, PeerTransport, PeerTransportFactory, SessionDescription, TransportEvent,
    TransportEventSink, TransportStates,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Creates a [`WebRtcPeerTransport`] per remote participant
pub struct WebRtcTransportFactory {
    api: API,
    rtc_config: RTCConfiguration,
}

impl WebRtcTransportFactory {
    pub fn new(ice: &IceConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| DomainError::Media(format!("failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| DomainError::Media(format!("failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = ice
            .servers
            .iter()
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                username: s.username.clone().unwrap_or_default(),
                credential: s.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ice_candidate_pool_size: ice.candidate_pool_size,
            ..Default::default()
        };

        Ok(Self { api, rtc_config })
    }
}

#[async_trait]
impl PeerTransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        remote: &ParticipantId,
        events: TransportEventSink,
    ) -> Result<Arc<dyn PeerTransport>> {
        let pc = self
            .api
            .new_peer_connection(self.rtc_config.clone())
            .await
            .map_err(|e| DomainError::connectivity(remote, format!("failed to create peer connection: {}", e)))?;

        let transport = WebRtcPeerTransport::new(remote.clone(), Arc::new(pc));
        transport.install_handlers(events);
        debug!("Created peer connection for {}", remote);
        Ok(Arc::new(transport))
    }
}

pub struct WebRtcPeerTransport {
    remote: ParticipantId,
    pc: Arc<RTCPeerConnection>,
    attached: Mutex<HashSet<String>>,
    remote_media: Arc<Mutex<Option<RemoteMediaBundle>>>,
    ice_restart_pending: AtomicBool,
}

impl WebRtcPeerTransport {
    fn new(remote: ParticipantId, pc: Arc<RTCPeerConnection>) -> Self {
        Self {
            remote,
            pc,
            attached: Mutex::new(HashSet::new()),
            remote_media: Arc::new(Mutex::new(None)),
            ice_restart_pending: AtomicBool::new(false),
        }
    }

    fn install_handlers(&self, events: TransportEventSink) {
        let sink = events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                match candidate {
                    Some(c) => match c.to_json() {
                        Ok(init) => {
                            sink.emit(TransportEvent::LocalCandidate(convert::from_rtc_candidate(init)))
                        }
                        Err(e) => warn!("Dropping local candidate that failed to serialize: {}", e),
                    },
                    None => sink.emit(TransportEvent::CandidateGatheringComplete),
                }
                Box::pin(async {})
            }));

        let sink = events.clone();
        self.pc.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                sink.emit(TransportEvent::ConnectionStateChanged(convert::connectivity(state)));
                Box::pin(async {})
            },
        ));

        let sink = events.clone();
        self.pc.on_ice_connection_state_change(Box::new(
            move |state: RTCIceConnectionState| {
                sink.emit(TransportEvent::IceConnectionStateChanged(convert::ice_connection(
                    state,
                )));
                Box::pin(async {})
            },
        ));

        let sink = events.clone();
        self.pc
            .on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
                sink.emit(TransportEvent::SignalingStateChanged(convert::signaling(state)));
                Box::pin(async {})
            }));

        let sink = events.clone();
        self.pc.on_negotiation_needed(Box::new(move || {
            sink.emit(TransportEvent::NegotiationNeeded);
            Box::pin(async {})
        }));

        let sink = events;
        let remote = self.remote.clone();
        let remote_media = Arc::clone(&self.remote_media);
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let sink = sink.clone();
                let remote = remote.clone();
                let remote_media = Arc::clone(&remote_media);
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => TrackKind::Audio,
                        RTPCodecType::Video => TrackKind::Video,
                        _ => return,
                    };
                    let info = RemoteTrackInfo {
                        id: track.id(),
                        kind,
                    };
                    info!("Remote {} track {} from {}", kind, info.id, remote);

                    let bundle = {
                        let mut guard = remote_media.lock();
                        let bundle =
                            guard.get_or_insert_with(|| RemoteMediaBundle::new(track.stream_id()));
                        bundle.upsert(info.clone());
                        bundle.clone()
                    };
                    sink.emit(TransportEvent::RemoteMedia(bundle));

                    tokio::spawn(drain_remote_track(track, info.id, remote_media, sink));
                })
            },
        ));
    }
}

/// Read the track until it ends, then drop it from the remote bundle
async fn drain_remote_track(
    track: Arc<TrackRemote>,
    track_id: String,
    remote_media: Arc<Mutex<Option<RemoteMediaBundle>>>,
    sink: TransportEventSink,
) {
    while track.read_rtp().await.is_ok() {}

    let bundle = {
        let mut guard = remote_media.lock();
        match guard.as_mut() {
            Some(bundle) => {
                bundle.tracks.retain(|t| t.id != track_id);
                bundle.clone()
            }
            None => return,
        }
    };
    debug!("Remote track {} ended", track_id);
    sink.emit(TransportEvent::RemoteMedia(bundle));
}

#[async_trait]
impl PeerTransport for WebRtcPeerTransport {
    async fn attach_local_media(&self, media: &LocalMediaBundle) -> Result<()> {
        for track in media.tracks() {
            if self.attached.lock().contains(track.id()) {
                continue;
            }
            let local = track
                .as_any()
                .downcast_ref::<WebRtcLocalTrack>()
                .ok_or_else(|| {
                    DomainError::Media(format!(
                        "track {} cannot be sent over a webrtc transport",
                        track.id()
                    ))
                })?;

            let sender = self
                .pc
                .add_track(local.rtc_track() as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| DomainError::Media(format!("failed to add track {}: {}", track.id(), e)))?;

            // Incoming RTCP must be read for the interceptors to work
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            });

            self.attached.lock().insert(track.id().to_string());
            debug!("Attached {} track {} for {}", track.kind(), track.id(), self.remote);
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let options = if self.ice_restart_pending.swap(false, Ordering::SeqCst) {
            Some(RTCOfferOptions {
                ice_restart: true,
                ..Default::default()
            })
        } else {
            None
        };
        let offer = self
            .pc
            .create_offer(options)
            .await
            .map_err(|e| DomainError::negotiation(&self.remote, format!("create offer: {}", e)))?;
        convert::from_rtc_description(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| DomainError::negotiation(&self.remote, format!("create answer: {}", e)))?;
        convert::from_rtc_description(&answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let description = convert::to_rtc_description(description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(|e| DomainError::negotiation(&self.remote, format!("set local description: {}", e)))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let description = convert::to_rtc_description(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| DomainError::negotiation(&self.remote, format!("set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(convert::to_rtc_candidate(candidate))
            .await
            .map_err(|e| DomainError::connectivity(&self.remote, format!("add ICE candidate: {}", e)))
    }

    fn supports_ice_restart(&self) -> bool {
        true
    }

    fn restart_ice(&self) -> Result<()> {
        self.ice_restart_pending.store(true, Ordering::SeqCst);
        info!("ICE restart requested for {}", self.remote);
        Ok(())
    }

    fn states(&self) -> TransportStates {
        TransportStates {
            connection: convert::connectivity(self.pc.connection_state()),
            ice_connection: convert::ice_connection(self.pc.ice_connection_state()),
            signaling: convert::signaling(self.pc.signaling_state()),
            ice_gathering: convert::gathering(self.pc.ice_gathering_state()),
        }
    }

    async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .map_err(|e| DomainError::connectivity(&self.remote, format!("close: {}", e)))
    }
}
