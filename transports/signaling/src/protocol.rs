//! Hub protocol types (JSON encoding)
//!
//! Every record is a JSON object terminated by [`RECORD_SEPARATOR`]; one
//! transport frame may carry several records. The connection opens with a
//! handshake record in each direction, after which records are typed by the
//! numeric `type` field (see [`message_types`]).

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Terminator appended to every record
pub const RECORD_SEPARATOR: char = '\u{1e}';

/// Protocol name announced in the handshake
pub const PROTOCOL_NAME: &str = "json";

/// Protocol version announced in the handshake
pub const PROTOCOL_VERSION: u32 = 1;

/// Numeric record types
pub mod message_types {
    /// Method call (client → server RPC, or server → client push event)
    pub const INVOCATION: u8 = 1;
    pub const STREAM_ITEM: u8 = 2;
    /// Result of an invocation that carried an id
    pub const COMPLETION: u8 = 3;
    pub const STREAM_INVOCATION: u8 = 4;
    pub const CANCEL_INVOCATION: u8 = 5;
    /// Keepalive
    pub const PING: u8 = 6;
    /// Server is closing the connection
    pub const CLOSE: u8 = 7;
}

/// First record sent by the client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandshakeRequest {
    pub protocol: String,
    pub version: u32,
}

impl Default for HandshakeRequest {
    fn default() -> Self {
        Self {
            protocol: PROTOCOL_NAME.to_string(),
            version: PROTOCOL_VERSION,
        }
    }
}

impl HandshakeRequest {
    /// Encode as a terminated record
    pub fn to_record(&self) -> Result<String> {
        let mut json = serde_json::to_string(self).map_err(|e| {
            Error::SerializationError(format!("Failed to serialize handshake: {}", e))
        })?;
        json.push(RECORD_SEPARATOR);
        Ok(json)
    }
}

/// Server reply to the handshake (`{}` on success)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HandshakeResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Decoded hub record
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    /// RPC call or push event
    Invocation {
        /// Present for client RPCs that expect a completion
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
    },
    /// Result of an RPC
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
    /// Record types this layer does not use (streaming)
    Unsupported(u8),
}

/// Wire shape shared by every record type
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    invocation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    arguments: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    allow_reconnect: Option<bool>,
}

impl HubMessage {
    /// Build an RPC invocation
    pub fn invocation(
        invocation_id: impl Into<String>,
        target: impl Into<String>,
        arguments: Vec<Value>,
    ) -> Self {
        HubMessage::Invocation {
            invocation_id: Some(invocation_id.into()),
            target: target.into(),
            arguments,
        }
    }

    /// Build a push event (invocation without id)
    pub fn push(target: impl Into<String>, arguments: Vec<Value>) -> Self {
        HubMessage::Invocation {
            invocation_id: None,
            target: target.into(),
            arguments,
        }
    }

    /// Encode as a terminated record
    pub fn to_record(&self) -> Result<String> {
        let raw = match self {
            HubMessage::Invocation {
                invocation_id,
                target,
                arguments,
            } => RawMessage {
                kind: message_types::INVOCATION,
                invocation_id: invocation_id.clone(),
                target: Some(target.clone()),
                arguments: Some(arguments.clone()),
                ..Default::default()
            },
            HubMessage::Completion {
                invocation_id,
                result,
                error,
            } => RawMessage {
                kind: message_types::COMPLETION,
                invocation_id: Some(invocation_id.clone()),
                result: result.clone(),
                error: error.clone(),
                ..Default::default()
            },
            HubMessage::Ping => RawMessage {
                kind: message_types::PING,
                ..Default::default()
            },
            HubMessage::Close {
                error,
                allow_reconnect,
            } => RawMessage {
                kind: message_types::CLOSE,
                error: error.clone(),
                allow_reconnect: Some(*allow_reconnect),
                ..Default::default()
            },
            HubMessage::Unsupported(kind) => {
                return Err(Error::Protocol(format!(
                    "Cannot encode unsupported message type {}",
                    kind
                )))
            }
        };

        let mut json = serde_json::to_string(&raw).map_err(|e| {
            Error::SerializationError(format!("Failed to serialize hub message: {}", e))
        })?;
        json.push(RECORD_SEPARATOR);
        Ok(json)
    }

    /// Parse a single record (without its separator)
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawMessage = serde_json::from_str(json).map_err(|e| {
            Error::SerializationError(format!("Failed to deserialize hub message: {}", e))
        })?;

        let message = match raw.kind {
            message_types::INVOCATION => HubMessage::Invocation {
                invocation_id: raw.invocation_id,
                target: raw
                    .target
                    .ok_or_else(|| Error::Protocol("Invocation without target".to_string()))?,
                arguments: raw.arguments.unwrap_or_default(),
            },
            message_types::COMPLETION => HubMessage::Completion {
                invocation_id: raw.invocation_id.ok_or_else(|| {
                    Error::Protocol("Completion without invocationId".to_string())
                })?,
                result: raw.result,
                error: raw.error,
            },
            message_types::PING => HubMessage::Ping,
            message_types::CLOSE => HubMessage::Close {
                error: raw.error,
                allow_reconnect: raw.allow_reconnect.unwrap_or(true),
            },
            other => HubMessage::Unsupported(other),
        };

        Ok(message)
    }
}

/// Split a transport frame into its non-empty records
pub fn split_records(frame: &str) -> impl Iterator<Item = &str> {
    frame
        .split(RECORD_SEPARATOR)
        .filter(|record| !record.trim().is_empty())
}

/// Decode every well-formed record in a frame
///
/// Malformed records are logged and skipped; the rest of the frame is kept.
pub fn decode_frame(frame: &str) -> Vec<HubMessage> {
    decode_records(split_records(frame))
}

fn decode_records<'a>(records: impl Iterator<Item = &'a str>) -> Vec<HubMessage> {
    records
        .filter_map(|record| match HubMessage::from_json(record) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!("Skipping malformed hub record: {}", e);
                None
            }
        })
        .collect()
}

/// Parse the handshake reply at the start of `frame`
///
/// Returns the reply and any records that followed it in the same frame.
pub fn parse_handshake(frame: &str) -> Result<(HandshakeResponse, Vec<HubMessage>)> {
    let mut records = split_records(frame);
    let first = records
        .next()
        .ok_or_else(|| Error::Protocol("Empty handshake response".to_string()))?;

    let response: HandshakeResponse = serde_json::from_str(first).map_err(|e| {
        Error::Protocol(format!("Invalid handshake response: {}", e))
    })?;

    Ok((response, decode_records(records)))
}
