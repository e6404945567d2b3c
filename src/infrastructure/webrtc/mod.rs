//! webrtc crate adapters for the transport and media ports

pub mod convert;
pub mod media;
pub mod transport;

pub use media::{SyntheticMediaSource, WebRtcLocalTrack};
pub use transport::{WebRtcPeerTransport, WebRtcTransportFactory};
