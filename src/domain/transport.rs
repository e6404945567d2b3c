//! Peer transport port
//!
//! The peer transport is the point-to-point media connection to one remote
//! participant. The core never touches ICE/DTLS/SRTP itself; it drives a
//! transport through this trait and reacts to the [`TransportEvent`]s the
//! transport emits.

use super::media::{LocalMediaBundle, RemoteMediaBundle};
use super::shared::{ParticipantId, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Session description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// Session description in the JSON shape browsers exchange:
/// `{"type": "offer", "sdp": "v=0..."}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// ICE candidate in the JSON shape of `RTCIceCandidate.toJSON()`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Aggregate connection state of the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectivityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectivityState::New => "new",
            ConnectivityState::Connecting => "connecting",
            ConnectivityState::Connected => "connected",
            ConnectivityState::Disconnected => "disconnected",
            ConnectivityState::Failed => "failed",
            ConnectivityState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ICE agent connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Offer/answer signaling state of the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

/// ICE candidate gathering state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceGatheringState {
    New,
    Gathering,
    Complete,
}

/// Snapshot of every transport-level state the engine observes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportStates {
    pub connection: ConnectivityState,
    pub ice_connection: IceConnectionState,
    pub signaling: SignalingState,
    pub ice_gathering: IceGatheringState,
}

impl TransportStates {
    /// Hard failure at either the connection or the ICE level
    pub fn is_failed(&self) -> bool {
        self.connection == ConnectivityState::Failed
            || self.ice_connection == IceConnectionState::Failed
    }
}

impl Default for TransportStates {
    fn default() -> Self {
        Self {
            connection: ConnectivityState::New,
            ice_connection: IceConnectionState::New,
            signaling: SignalingState::Stable,
            ice_gathering: IceGatheringState::New,
        }
    }
}

/// Events a transport reports back to the engine
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A local ICE candidate was discovered
    LocalCandidate(IceCandidate),
    /// Candidate gathering finished
    CandidateGatheringComplete,
    ConnectionStateChanged(ConnectivityState),
    IceConnectionStateChanged(IceConnectionState),
    SignalingStateChanged(SignalingState),
    /// Local track changes require a new offer/answer round
    NegotiationNeeded,
    /// The remote media bundle changed; carries the complete new bundle
    RemoteMedia(RemoteMediaBundle),
}

/// Callback handed to a transport at creation for reporting its events
#[derive(Clone)]
pub struct TransportEventSink(Arc<dyn Fn(TransportEvent) + Send + Sync>);

impl TransportEventSink {
    pub fn new(f: impl Fn(TransportEvent) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn emit(&self, event: TransportEvent) {
        (self.0)(event)
    }
}

impl fmt::Debug for TransportEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TransportEventSink")
    }
}

/// Point-to-point media transport toward one remote participant
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Attach every track of the bundle not attached yet
    async fn attach_local_media(&self, media: &LocalMediaBundle) -> Result<()>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    fn supports_ice_restart(&self) -> bool;

    /// Request an ICE restart; the next offer carries fresh ICE credentials
    fn restart_ice(&self) -> Result<()>;

    /// Sample the current transport-level states
    fn states(&self) -> TransportStates;

    async fn close(&self) -> Result<()>;
}

/// Creates one transport per remote participant
#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    async fn create(
        &self,
        remote: &ParticipantId,
        events: TransportEventSink,
    ) -> Result<Arc<dyn PeerTransport>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_description_uses_browser_json_shape() {
        let json = r#"{"type":"offer","sdp":"v=0\r\n"}"#;
        let desc = SessionDescription::from_json(json).unwrap();
        assert_eq!(desc.kind, SdpKind::Offer);
        assert_eq!(desc.to_json().unwrap(), json);
    }

    #[test]
    fn test_candidate_parses_browser_json() {
        let json = r#"{"candidate":"candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host","sdpMid":"0","sdpMLineIndex":0,"usernameFragment":"abcd"}"#;
        let candidate = IceCandidate::from_json(json).unwrap();
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));
        assert_eq!(candidate.username_fragment.as_deref(), Some("abcd"));
    }

    #[test]
    fn test_malformed_description_is_invalid_payload() {
        let err = SessionDescription::from_json("{\"sdp\":1}").unwrap_err();
        assert!(matches!(err, crate::domain::DomainError::InvalidPayload(_)));
    }

    #[test]
    fn test_failed_states() {
        let mut states = TransportStates::default();
        assert!(!states.is_failed());
        states.ice_connection = IceConnectionState::Failed;
        assert!(states.is_failed());
    }
}
