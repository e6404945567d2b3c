//! Local media backed by webrtc sample tracks
//!
//! There is no capture device in a headless client. [`SyntheticMediaSource`]
//! creates a VP8 video track and an Opus audio track; the audio track is fed
//! Opus silence so the remote side sees a live stream. A capture backend can
//! push encoded frames through [`WebRtcLocalTrack::write_sample`].

use crate::domain::media::{
    LocalMediaBundle, LocalTrack, MediaConstraints, MediaSource, TrackKind, VideoSettings,
};
use crate::domain::shared::{DomainError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// One 20ms Opus frame of silence
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];
const OPUS_FRAME: Duration = Duration::from_millis(20);

/// A local track the webrtc transport can send
pub struct WebRtcLocalTrack {
    id: String,
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
    stopped: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

impl WebRtcLocalTrack {
    pub fn new(kind: TrackKind, stream_id: &str) -> Self {
        let id = format!("{}-{}", kind, Uuid::new_v4());
        let codec = match kind {
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
        };
        let track = Arc::new(TrackLocalStaticSample::new(
            codec,
            id.clone(),
            stream_id.to_owned(),
        ));
        let (stop_tx, _) = watch::channel(false);

        Self {
            id,
            kind,
            track,
            stopped: AtomicBool::new(false),
            stop_tx,
        }
    }

    /// The underlying webrtc track, for `add_track`
    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.track)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Write one encoded frame; ignored once the track is stopped
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<()> {
        if self.is_stopped() {
            return Ok(());
        }
        let sample = Sample {
            data,
            duration,
            timestamp: std::time::SystemTime::now(),
            ..Default::default()
        };
        self.track
            .write_sample(&sample)
            .await
            .map_err(|e| DomainError::Media(format!("failed to write sample on {}: {}", self.id, e)))
    }

    fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }
}

impl std::fmt::Debug for WebRtcLocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcLocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl LocalTrack for WebRtcLocalTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            let _ = self.stop_tx.send(true);
            debug!("Stopped local {} track {}", self.kind, self.id);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Media source producing webrtc sample tracks without a capture device
#[derive(Debug, Default)]
pub struct SyntheticMediaSource;

impl SyntheticMediaSource {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaSource for SyntheticMediaSource {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMediaBundle> {
        if !constraints.video && !constraints.audio {
            return Err(DomainError::Media(
                "constraints request neither audio nor video".to_string(),
            ));
        }

        let stream_id = format!("meshcall-{}", Uuid::new_v4());
        let mut tracks: Vec<Arc<dyn LocalTrack>> = Vec::new();
        let mut video_settings = None;

        if constraints.video {
            tracks.push(Arc::new(WebRtcLocalTrack::new(TrackKind::Video, &stream_id)));
            video_settings = Some(VideoSettings {
                width: constraints.width,
                height: constraints.height,
            });
        }
        if constraints.audio {
            let audio = Arc::new(WebRtcLocalTrack::new(TrackKind::Audio, &stream_id));
            tokio::spawn(pump_silence(Arc::clone(&audio)));
            tracks.push(audio);
        }

        info!(
            "Acquired synthetic media {} ({} tracks)",
            stream_id,
            tracks.len()
        );
        Ok(LocalMediaBundle::new(stream_id, tracks, video_settings))
    }
}

async fn pump_silence(track: Arc<WebRtcLocalTrack>) {
    let mut stop = track.stop_signal();
    let mut ticker = tokio::time::interval(OPUS_FRAME);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // Nothing is sent before the track is bound to a transport
                let _ = track
                    .write_sample(Bytes::from_static(&OPUS_SILENCE), OPUS_FRAME)
                    .await;
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }
    debug!("Silence pump for {} ended", track.id());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_honors_constraints() {
        let source = SyntheticMediaSource::new();
        let constraints = MediaConstraints {
            video: false,
            ..MediaConstraints::default()
        };
        let bundle = source.acquire(&constraints).await.unwrap();
        assert_eq!(bundle.count(TrackKind::Audio), 1);
        assert_eq!(bundle.count(TrackKind::Video), 0);
        assert!(bundle.video_settings().is_none());
        bundle.stop();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let track = WebRtcLocalTrack::new(TrackKind::Video, "s1");
        track.stop();
        track.stop();
        assert!(track.is_stopped());
        track
            .write_sample(Bytes::from_static(b"frame"), Duration::from_millis(33))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rejects_empty_constraints() {
        let constraints = MediaConstraints {
            video: false,
            audio: false,
            ..MediaConstraints::default()
        };
        assert!(SyntheticMediaSource::new().acquire(&constraints).await.is_err());
    }

    #[test]
    fn test_downcast_from_trait_object() {
        let track: Arc<dyn LocalTrack> = Arc::new(WebRtcLocalTrack::new(TrackKind::Audio, "s1"));
        assert!(track.as_any().downcast_ref::<WebRtcLocalTrack>().is_some());
    }
}
