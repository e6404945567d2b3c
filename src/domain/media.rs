//! Local and remote media bundles
//!
//! The local bundle is acquired once and shared read-only by every peer
//! session. Remote bundles belong to one session each and are replaced
//! wholesale whenever the transport reports new remote tracks.

use super::shared::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An outbound track produced by a [`MediaSource`].
///
/// Transports downcast through [`LocalTrack::as_any`] to reach the concrete
/// track type they know how to send.
pub trait LocalTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    fn kind(&self) -> TrackKind;

    /// Stop producing media. Idempotent.
    fn stop(&self);

    fn as_any(&self) -> &dyn Any;
}

/// Capture hints passed to the media source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
    /// Ideal capture width
    pub width: u32,
    /// Ideal capture height
    pub height: u32,
    pub facing_mode: String,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
            width: 1280,
            height: 720,
            facing_mode: "user".to_string(),
        }
    }
}

/// Negotiated video settings of an acquired bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoSettings {
    pub width: u32,
    pub height: u32,
}

/// The set of outbound tracks owned by this client
#[derive(Debug)]
pub struct LocalMediaBundle {
    stream_id: String,
    tracks: Vec<Arc<dyn LocalTrack>>,
    video_settings: Option<VideoSettings>,
    acquired_at: DateTime<Utc>,
}

impl LocalMediaBundle {
    pub fn new(
        stream_id: impl Into<String>,
        tracks: Vec<Arc<dyn LocalTrack>>,
        video_settings: Option<VideoSettings>,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            tracks,
            video_settings,
            acquired_at: Utc::now(),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn tracks(&self) -> &[Arc<dyn LocalTrack>] {
        &self.tracks
    }

    pub fn video_settings(&self) -> Option<VideoSettings> {
        self.video_settings
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    pub fn count(&self, kind: TrackKind) -> usize {
        self.tracks.iter().filter(|t| t.kind() == kind).count()
    }

    /// Stop every track in the bundle
    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    pub fn summary(&self) -> LocalMediaSummary {
        LocalMediaSummary {
            stream_id: self.stream_id.clone(),
            video_tracks: self.count(TrackKind::Video),
            audio_tracks: self.count(TrackKind::Audio),
            video_settings: self.video_settings,
        }
    }
}

/// Serializable view of the local bundle for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalMediaSummary {
    pub stream_id: String,
    pub video_tracks: usize,
    pub audio_tracks: usize,
    pub video_settings: Option<VideoSettings>,
}

/// Remote track as reported by the peer transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrackInfo {
    pub id: String,
    pub kind: TrackKind,
}

/// Tracks received from one remote participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMediaBundle {
    pub stream_id: String,
    pub tracks: Vec<RemoteTrackInfo>,
}

impl RemoteMediaBundle {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            tracks: Vec::new(),
        }
    }

    /// Add a track, replacing one with the same id
    pub fn upsert(&mut self, track: RemoteTrackInfo) {
        match self.tracks.iter_mut().find(|t| t.id == track.id) {
            Some(existing) => *existing = track,
            None => self.tracks.push(track),
        }
    }

    pub fn count(&self, kind: TrackKind) -> usize {
        self.tracks.iter().filter(|t| t.kind == kind).count()
    }

    /// Human readable status of what was received
    pub fn describe(&self) -> &'static str {
        match (self.count(TrackKind::Video), self.count(TrackKind::Audio)) {
            (0, 0) => "No media tracks received",
            (0, _) => "Audio only (no video)",
            (_, 0) => "Video only (no audio)",
            _ => "Connected",
        }
    }
}

/// Port for acquiring the local media bundle
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Acquire outbound tracks honoring the constraints as hints
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMediaBundle>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_bundle_upsert_replaces_same_id() {
        let mut bundle = RemoteMediaBundle::new("s1");
        bundle.upsert(RemoteTrackInfo {
            id: "t1".into(),
            kind: TrackKind::Audio,
        });
        bundle.upsert(RemoteTrackInfo {
            id: "t1".into(),
            kind: TrackKind::Video,
        });
        assert_eq!(bundle.tracks.len(), 1);
        assert_eq!(bundle.count(TrackKind::Video), 1);
    }

    #[test]
    fn test_remote_bundle_describe() {
        let mut bundle = RemoteMediaBundle::new("s1");
        assert_eq!(bundle.describe(), "No media tracks received");

        bundle.upsert(RemoteTrackInfo {
            id: "a".into(),
            kind: TrackKind::Audio,
        });
        assert_eq!(bundle.describe(), "Audio only (no video)");

        bundle.upsert(RemoteTrackInfo {
            id: "v".into(),
            kind: TrackKind::Video,
        });
        assert_eq!(bundle.describe(), "Connected");
    }
}
