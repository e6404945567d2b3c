//! Status event log for the command-line client
//!
//! Renders every status event as one log line; with `json` set the event is
//! emitted as its serialized JSON instead.

use super::status::StatusEvent;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub fn render(event: &StatusEvent) -> String {
    match event {
        StatusEvent::Connection { state, message, .. } => {
            format!("[signaling] {}: {}", state, message)
        }
        StatusEvent::LocalMedia { active, message, .. } => {
            format!("[media] {} ({})", message, if *active { "active" } else { "inactive" })
        }
        StatusEvent::Room { room, message, .. } => match room {
            Some(room) => format!("[room] {} ({})", message, room),
            None => format!("[room] {}", message),
        },
        StatusEvent::Peer {
            peer,
            state,
            message,
            ..
        } => format!("[peer {}] {}: {}", peer, state, message),
        StatusEvent::Error {
            category,
            peer,
            message,
            ..
        } => match peer {
            Some(peer) => format!("[error/{} {}] {}", category, peer, message),
            None => format!("[error/{}] {}", category, message),
        },
        StatusEvent::Diagnostics { report, .. } => {
            let mut out = format!(
                "[diagnostics] signaling {}, {} peer(s)",
                report.signaling,
                report.peers.len()
            );
            for peer in &report.peers {
                out.push_str(&format!(
                    "\n  {} {:?} connection={} media: {}",
                    peer.peer, peer.verdict, peer.transport.connection, peer.remote_status
                ));
            }
            for suggestion in &report.suggestions {
                out.push_str(&format!("\n  - {}", suggestion));
            }
            out
        }
        StatusEvent::RecoveryRecommended {
            failed_peers,
            auto_reset,
            ..
        } => {
            let peers: Vec<&str> = failed_peers.iter().map(|p| p.as_str()).collect();
            format!(
                "[recovery] full reset recommended for {} ({})",
                peers.join(", "),
                if *auto_reset { "resetting automatically" } else { "refresh to recover" }
            )
        }
    }
}

/// Log status events until the broadcaster goes away
pub fn spawn_status_log(mut rx: broadcast::Receiver<StatusEvent>, json: bool) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) if json => match serde_json::to_string(&event) {
                    Ok(line) => info!("{}", line),
                    Err(e) => warn!("Failed to serialize status event: {}", e),
                },
                Ok(event) => info!("{}", render(&event)),
                Err(RecvError::Lagged(skipped)) => warn!("Status log skipped {} events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
        debug!("Status log stopped");
    })
}
