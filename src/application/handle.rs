//! Cloneable handle to a running engine

use super::events::{Command, EngineEvent, EngineSnapshot};
use super::monitor::DiagnosticsReport;
use crate::domain::shared::{DomainError, Result, RoomId};
use crate::domain::signaling::SignalingEvent;
use crate::interface::status::{StatusBroadcaster, StatusEvent};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<EngineEvent>,
    status: StatusBroadcaster,
}

impl EngineHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<EngineEvent>, status: StatusBroadcaster) -> Self {
        Self { tx, status }
    }

    /// Leave every session, join `room` and make sure local media is active
    pub async fn join_room(&self, room: RoomId) -> Result<()> {
        self.request(|reply| Command::JoinRoom { room, reply })
            .await?
    }

    pub async fn leave_room(&self) -> Result<()> {
        self.request(|reply| Command::LeaveRoom { reply }).await?
    }

    /// Close every session, release local media and rejoin the current room
    pub async fn refresh(&self) -> Result<()> {
        self.request(|reply| Command::Refresh { reply }).await?
    }

    /// Leave, release local media, then rejoin the default room
    pub async fn hangup(&self) -> Result<()> {
        self.request(|reply| Command::Hangup { reply }).await?
    }

    pub async fn start_media(&self) -> Result<()> {
        self.request(|reply| Command::StartMedia { reply }).await?
    }

    pub async fn diagnose(&self) -> Result<DiagnosticsReport> {
        self.request(|reply| Command::Diagnose { reply }).await
    }

    pub async fn snapshot(&self) -> Result<EngineSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    /// Feed a signaling event into the engine
    pub fn dispatch(&self, event: SignalingEvent) {
        if self.tx.send(EngineEvent::Signaling(event)).is_err() {
            warn!("Engine stopped; dropping signaling event");
        }
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.status.subscribe()
    }

    pub fn status(&self) -> &StatusBroadcaster {
        &self.status
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineEvent::Command(build(reply)))
            .map_err(|_| DomainError::EngineStopped)?;
        rx.await.map_err(|_| DomainError::EngineStopped)
    }
}
