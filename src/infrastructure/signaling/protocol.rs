//! SignalR JSON hub protocol
//!
//! Every frame is a JSON object terminated by the record separator (0x1E).
//! A WebSocket text message may carry several frames. Only the message
//! types a client needs are modelled; the rest decode to [`HubMessage::Other`].

use crate::domain::shared::{DomainError, Result};
use serde::Deserialize;
use serde_json::{json, Map, Value};

pub const RECORD_SEPARATOR: char = '\u{1e}';

pub const INVOCATION: u64 = 1;
pub const STREAM_ITEM: u64 = 2;
pub const COMPLETION: u64 = 3;
pub const PING: u64 = 6;
pub const CLOSE: u64 = 7;

#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
    },
    Completion {
        invocation_id: String,
        result: Option<Value>,
        error: Option<String>,
    },
    Ping,
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
    /// Stream items, cancel requests and future message types
    Other(u64),
}

impl HubMessage {
    pub fn invocation(invocation_id: Option<String>, target: &str, arguments: Vec<Value>) -> Self {
        HubMessage::Invocation {
            invocation_id,
            target: target.to_string(),
            arguments,
        }
    }

    /// Serialize as one frame, separator included
    pub fn encode(&self) -> Result<String> {
        let value = match self {
            HubMessage::Invocation {
                invocation_id,
                target,
                arguments,
            } => {
                let mut frame = json!({
                    "type": INVOCATION,
                    "target": target,
                    "arguments": arguments,
                });
                if let Some(id) = invocation_id {
                    frame["invocationId"] = Value::from(id.as_str());
                }
                frame
            }
            HubMessage::Completion {
                invocation_id,
                result,
                error,
            } => {
                let mut frame = json!({ "type": COMPLETION, "invocationId": invocation_id });
                if let Some(result) = result {
                    frame["result"] = result.clone();
                }
                if let Some(error) = error {
                    frame["error"] = Value::from(error.as_str());
                }
                frame
            }
            HubMessage::Ping => json!({ "type": PING }),
            HubMessage::Close {
                error,
                allow_reconnect,
            } => {
                let mut frame = json!({ "type": CLOSE, "allowReconnect": allow_reconnect });
                if let Some(error) = error {
                    frame["error"] = Value::from(error.as_str());
                }
                frame
            }
            HubMessage::Other(kind) => {
                return Err(DomainError::InvalidPayload(format!(
                    "cannot encode hub message type {}",
                    kind
                )))
            }
        };
        Ok(frame(&value.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        let obj = value
            .as_object()
            .ok_or_else(|| DomainError::InvalidPayload("hub message is not an object".into()))?;
        let kind = obj
            .get("type")
            .and_then(Value::as_u64)
            .ok_or_else(|| DomainError::InvalidPayload("hub message without a type".into()))?;

        let message = match kind {
            INVOCATION => HubMessage::Invocation {
                invocation_id: string_field(obj, "invocationId"),
                target: string_field(obj, "target").ok_or_else(|| {
                    DomainError::InvalidPayload("invocation without a target".into())
                })?,
                arguments: match obj.get("arguments") {
                    Some(Value::Array(args)) => args.clone(),
                    _ => Vec::new(),
                },
            },
            COMPLETION => HubMessage::Completion {
                invocation_id: string_field(obj, "invocationId").ok_or_else(|| {
                    DomainError::InvalidPayload("completion without an invocation id".into())
                })?,
                result: obj.get("result").cloned(),
                error: string_field(obj, "error"),
            },
            PING => HubMessage::Ping,
            CLOSE => HubMessage::Close {
                error: string_field(obj, "error"),
                allow_reconnect: obj
                    .get("allowReconnect")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            },
            other => HubMessage::Other(other),
        };
        Ok(message)
    }
}

fn string_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_string)
}

fn frame(json: &str) -> String {
    let mut out = String::with_capacity(json.len() + 1);
    out.push_str(json);
    out.push(RECORD_SEPARATOR);
    out
}

/// Split a text message into its frames, dropping the separators
pub fn split_frames(text: &str) -> impl Iterator<Item = &str> {
    text.split(RECORD_SEPARATOR).filter(|f| !f.trim().is_empty())
}

/// Decode every frame of a text message
pub fn decode_frames(text: &str) -> Result<Vec<HubMessage>> {
    split_frames(text).map(HubMessage::decode).collect()
}

/// The first frame a client sends
pub fn handshake_request() -> String {
    frame(r#"{"protocol":"json","version":1}"#)
}

#[derive(Debug, Deserialize)]
struct HandshakeResponse {
    #[serde(default)]
    error: Option<String>,
}

/// Check the server's handshake response. Frames that arrived in the same
/// text message after it are returned for normal processing.
pub fn parse_handshake_response(text: &str) -> Result<Vec<HubMessage>> {
    let (first, rest) = text.split_once(RECORD_SEPARATOR).ok_or_else(|| {
        DomainError::Signaling("incomplete handshake response".to_string())
    })?;
    let response: HandshakeResponse = serde_json::from_str(first)
        .map_err(|e| DomainError::Signaling(format!("malformed handshake response: {}", e)))?;
    if let Some(error) = response.error {
        return Err(DomainError::Signaling(format!("handshake rejected: {}", error)));
    }
    decode_frames(rest)
}

/// Body of the negotiate endpoint's response
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiateResponse {
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub connection_token: Option<String>,
    #[serde(default)]
    pub negotiate_version: u32,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl NegotiateResponse {
    /// Token for the `id` query parameter; version 0 servers only send the id
    pub fn token(&self) -> Option<&str> {
        if self.negotiate_version >= 1 {
            self.connection_token.as_deref()
        } else {
            self.connection_id.as_deref()
        }
    }
}
