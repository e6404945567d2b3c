//! Signaling relay contract
//!
//! Outbound procedure invocations, inbound events and the connection
//! lifecycle notifications exchanged with the signaling relay. Payloads that
//! carry session descriptions or ICE candidates are JSON strings.

use super::shared::{DomainError, ParticipantId, Result, RoomId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Procedures the client invokes on the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundCall {
    JoinRoom {
        room: RoomId,
    },
    LeaveRoom {
        room: RoomId,
        display_name: String,
    },
    /// Offers are addressed to the room; the relay forwards them to the
    /// other members.
    SendOffer {
        room: RoomId,
        description: String,
    },
    SendAnswer {
        target: ParticipantId,
        description: String,
    },
    SendIceCandidate {
        target: ParticipantId,
        candidate: String,
    },
}

impl OutboundCall {
    pub fn procedure(&self) -> &'static str {
        match self {
            OutboundCall::JoinRoom { .. } => "JoinRoom",
            OutboundCall::LeaveRoom { .. } => "LeaveRoom",
            OutboundCall::SendOffer { .. } => "SendOffer",
            OutboundCall::SendAnswer { .. } => "SendAnswer",
            OutboundCall::SendIceCandidate { .. } => "SendIceCandidate",
        }
    }

    /// Positional arguments in relay order
    pub fn arguments(&self) -> Vec<Value> {
        match self {
            OutboundCall::JoinRoom { room } => vec![Value::from(room.as_str())],
            OutboundCall::LeaveRoom { room, display_name } => {
                vec![Value::from(room.as_str()), Value::from(display_name.as_str())]
            }
            OutboundCall::SendOffer { room, description } => {
                vec![Value::from(room.as_str()), Value::from(description.as_str())]
            }
            OutboundCall::SendAnswer {
                target,
                description,
            } => vec![Value::from(target.as_str()), Value::from(description.as_str())],
            OutboundCall::SendIceCandidate { target, candidate } => {
                vec![Value::from(target.as_str()), Value::from(candidate.as_str())]
            }
        }
    }
}

/// Events delivered by the relay, plus connection lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    ReceiveOffer {
        offer: String,
        from: ParticipantId,
    },
    ReceiveAnswer {
        answer: String,
        from: ParticipantId,
    },
    ReceiveIceCandidate {
        candidate: String,
        from: ParticipantId,
    },
    UserJoined {
        id: ParticipantId,
        display_name: String,
    },
    UserLeft {
        id: ParticipantId,
        display_name: String,
    },
    /// The channel dropped and automatic reconnection started
    Reconnecting {
        error: Option<String>,
    },
    /// The channel is back, under a new connection identifier
    Reconnected {
        connection_id: Option<ParticipantId>,
    },
    /// The channel is gone for good; a manual restart is required
    Closed {
        error: Option<String>,
    },
}

impl SignalingEvent {
    /// Relay event names the client subscribes to
    pub const INBOUND: [&'static str; 5] = [
        "ReceiveOffer",
        "ReceiveAnswer",
        "ReceiveIceCandidate",
        "UserJoined",
        "UserLeft",
    ];

    /// Build an event from a relay invocation
    pub fn from_invocation(target: &str, args: &[Value]) -> Result<Self> {
        let event = match target {
            "ReceiveOffer" => SignalingEvent::ReceiveOffer {
                offer: string_arg(target, args, 0)?,
                from: ParticipantId::new(string_arg(target, args, 1)?),
            },
            "ReceiveAnswer" => SignalingEvent::ReceiveAnswer {
                answer: string_arg(target, args, 0)?,
                from: ParticipantId::new(string_arg(target, args, 1)?),
            },
            "ReceiveIceCandidate" => SignalingEvent::ReceiveIceCandidate {
                candidate: string_arg(target, args, 0)?,
                from: ParticipantId::new(string_arg(target, args, 1)?),
            },
            "UserJoined" => SignalingEvent::UserJoined {
                id: ParticipantId::new(string_arg(target, args, 0)?),
                display_name: optional_string_arg(args, 1),
            },
            "UserLeft" => SignalingEvent::UserLeft {
                id: ParticipantId::new(string_arg(target, args, 0)?),
                display_name: optional_string_arg(args, 1),
            },
            other => {
                return Err(DomainError::InvalidPayload(format!(
                    "unknown signaling event '{}'",
                    other
                )))
            }
        };
        Ok(event)
    }

    pub fn name(&self) -> &'static str {
        match self {
            SignalingEvent::ReceiveOffer { .. } => "ReceiveOffer",
            SignalingEvent::ReceiveAnswer { .. } => "ReceiveAnswer",
            SignalingEvent::ReceiveIceCandidate { .. } => "ReceiveIceCandidate",
            SignalingEvent::UserJoined { .. } => "UserJoined",
            SignalingEvent::UserLeft { .. } => "UserLeft",
            SignalingEvent::Reconnecting { .. } => "Reconnecting",
            SignalingEvent::Reconnected { .. } => "Reconnected",
            SignalingEvent::Closed { .. } => "Closed",
        }
    }
}

fn string_arg(target: &str, args: &[Value], index: usize) -> Result<String> {
    match args.get(index) {
        Some(Value::String(s)) => Ok(s.clone()),
        // Some relays send the description object itself instead of its JSON text
        Some(v @ Value::Object(_)) => Ok(v.to_string()),
        _ => Err(DomainError::InvalidPayload(format!(
            "{} expects a string argument at position {}",
            target, index
        ))),
    }
}

fn optional_string_arg(args: &[Value], index: usize) -> String {
    args.get(index)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// State of the signaling channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Reconnecting => "Reconnecting",
            ConnectionState::Disconnecting => "Disconnecting",
        };
        f.write_str(s)
    }
}

/// Outbound half of the signaling transport as the core sees it
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Invoke a relay procedure and wait for its completion
    async fn invoke(&self, call: OutboundCall) -> Result<()>;

    /// Identifier the relay assigned to this client, if connected
    fn connection_id(&self) -> Option<ParticipantId>;

    fn state(&self) -> ConnectionState;
}
