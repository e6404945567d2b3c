//! Status event stream for presentation and monitoring consumers

use crate::application::monitor::DiagnosticsReport;
use crate::domain::session::PeerSessionState;
use crate::domain::shared::{DomainError, ParticipantId, RoomId};
use crate::domain::signaling::ConnectionState;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Status event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusEvent {
    /// Signaling connection status
    Connection {
        state: ConnectionState,
        message: String,
        timestamp: i64,
    },
    /// Local media status
    LocalMedia {
        active: bool,
        message: String,
        timestamp: i64,
    },
    /// Current room changed
    Room {
        room: Option<RoomId>,
        message: String,
        timestamp: i64,
    },
    /// Per-peer status text
    Peer {
        peer: ParticipantId,
        state: PeerSessionState,
        message: String,
        timestamp: i64,
    },
    /// A surfaced error
    Error {
        category: String,
        peer: Option<ParticipantId>,
        message: String,
        timestamp: i64,
    },
    Diagnostics {
        report: DiagnosticsReport,
        timestamp: i64,
    },
    /// The monitor recommends closing and recreating every session
    RecoveryRecommended {
        failed_peers: Vec<ParticipantId>,
        auto_reset: bool,
        timestamp: i64,
    },
}

/// Status broadcaster
#[derive(Debug, Clone)]
pub struct StatusBroadcaster {
    tx: broadcast::Sender<StatusEvent>,
}

impl StatusBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    pub fn broadcast(&self, event: StatusEvent) {
        if self.tx.send(event).is_err() {
            debug!("No status subscribers");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn connection(&self, state: ConnectionState, message: impl Into<String>) {
        self.broadcast(StatusEvent::Connection {
            state,
            message: message.into(),
            timestamp: now(),
        });
    }

    pub fn local_media(&self, active: bool, message: impl Into<String>) {
        self.broadcast(StatusEvent::LocalMedia {
            active,
            message: message.into(),
            timestamp: now(),
        });
    }

    pub fn room(&self, room: Option<RoomId>, message: impl Into<String>) {
        self.broadcast(StatusEvent::Room {
            room,
            message: message.into(),
            timestamp: now(),
        });
    }

    pub fn peer(&self, peer: &ParticipantId, state: PeerSessionState, message: impl Into<String>) {
        self.broadcast(StatusEvent::Peer {
            peer: peer.clone(),
            state,
            message: message.into(),
            timestamp: now(),
        });
    }

    pub fn error(&self, error: &DomainError) {
        self.broadcast(StatusEvent::Error {
            category: error.category().to_string(),
            peer: error.peer().cloned(),
            message: error.to_string(),
            timestamp: now(),
        });
    }

    pub fn diagnostics(&self, report: DiagnosticsReport) {
        self.broadcast(StatusEvent::Diagnostics {
            report,
            timestamp: now(),
        });
    }

    pub fn recovery_recommended(&self, failed_peers: Vec<ParticipantId>, auto_reset: bool) {
        self.broadcast(StatusEvent::RecoveryRecommended {
            failed_peers,
            auto_reset,
            timestamp: now(),
        });
    }
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new(1000)
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe() {
        let status = StatusBroadcaster::new(16);
        assert_eq!(status.subscriber_count(), 0);
        let _rx = status.subscribe();
        assert_eq!(status.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_error_event_carries_peer() {
        let status = StatusBroadcaster::new(16);
        let mut rx = status.subscribe();

        status.error(&DomainError::negotiation(&"p3".into(), "bad answer"));

        match rx.recv().await.unwrap() {
            StatusEvent::Error {
                category, peer, ..
            } => {
                assert_eq!(category, "negotiation");
                assert_eq!(peer, Some(ParticipantId::new("p3")));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_event_serialization() {
        let event = StatusEvent::Peer {
            peer: "p2".into(),
            state: PeerSessionState::Connected,
            message: "Connected".to_string(),
            timestamp: 1,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"peer\""));
        assert!(json.contains("\"state\":\"connected\""));
    }

    #[test]
    fn test_broadcast_without_subscribers() {
        StatusBroadcaster::default().local_media(true, "Camera active");
    }
}
