//! Call session payload types (camelCase on the wire)

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Best-effort mirror of a server-side room
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoomState {
    pub call_id: String,

    /// Participants keyed by userId
    #[serde(default)]
    pub participants: HashMap<String, Participant>,

    #[serde(default)]
    pub max_participants: u32,

    #[serde(default)]
    pub is_locked: bool,

    /// Server timestamp (ISO 8601)
    #[serde(default)]
    pub created_at: String,
}

impl RoomState {
    pub fn participant(&self, user_id: &str) -> Option<&Participant> {
        self.participants.get(user_id)
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }
}

/// One participant of a room
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: String,

    #[serde(default)]
    pub display_name: String,

    /// Hub connection currently carrying this participant
    #[serde(default)]
    pub connection_id: String,

    #[serde(default)]
    pub audio_enabled: bool,

    #[serde(default)]
    pub video_enabled: bool,

    #[serde(default)]
    pub joined_at: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<NetworkQuality>,

    #[serde(default)]
    pub is_typing: bool,

    #[serde(default)]
    pub is_screen_sharing: bool,
}

/// Link quality reported by a participant
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    /// Any value this client does not know
    #[serde(other)]
    Unknown,
}

/// Raw link statistics attached to a quality report
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStats {
    /// Round-trip time in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtt: Option<f64>,

    /// Packet loss percentage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_loss: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChatMessageType {
    #[default]
    Text,
    Emoji,
    File,
    System,
    #[serde(other)]
    Unknown,
}

/// In-call chat message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,

    #[serde(default)]
    pub call_id: String,

    #[serde(default)]
    pub sender_id: String,

    #[serde(default)]
    pub sender_name: String,

    pub content: String,

    #[serde(rename = "type", default)]
    pub message_type: ChatMessageType,

    #[serde(default)]
    pub timestamp: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
}

/// ICE servers handed to the media engine
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IceConfiguration {
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,

    /// "all" or "relay"
    #[serde(default = "default_transport_policy")]
    pub ice_transport_policy: String,
}

fn default_transport_policy() -> String {
    "all".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    /// Accepts a single url string or an array
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Urls {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Urls::deserialize(deserializer)? {
        Urls::One(url) => vec![url],
        Urls::Many(urls) => urls,
    })
}

/// Post-call feedback
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallQualityReport {
    pub call_id: String,
    pub user_id: String,

    /// 1 (worst) to 5 (best)
    pub rating: u8,

    #[serde(default)]
    pub issues: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<NetworkStats>,
}

// ============================================================================
// Negotiation relay
// ============================================================================

/// SDP offer or answer relayed between two participants
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SdpMessage {
    pub call_id: String,
    pub from_user_id: String,
    pub to_user_id: String,
    pub sdp: String,
}

/// ICE candidate relayed between two participants
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateMessage {
    pub call_id: String,
    pub from_user_id: String,
    pub to_user_id: String,
    pub candidate: String,

    #[serde(default)]
    pub sdp_mid: Option<String>,

    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_m_line_index: Option<u32>,
}

/// WebRTC negotiation artifact; never interpreted by this layer
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationMessage {
    Offer(SdpMessage),
    Answer(SdpMessage),
    IceCandidate(IceCandidateMessage),
}

impl NegotiationMessage {
    pub fn call_id(&self) -> &str {
        match self {
            NegotiationMessage::Offer(m) | NegotiationMessage::Answer(m) => &m.call_id,
            NegotiationMessage::IceCandidate(m) => &m.call_id,
        }
    }

    pub fn from_user_id(&self) -> &str {
        match self {
            NegotiationMessage::Offer(m) | NegotiationMessage::Answer(m) => &m.from_user_id,
            NegotiationMessage::IceCandidate(m) => &m.from_user_id,
        }
    }

    pub fn to_user_id(&self) -> &str {
        match self {
            NegotiationMessage::Offer(m) | NegotiationMessage::Answer(m) => &m.to_user_id,
            NegotiationMessage::IceCandidate(m) => &m.to_user_id,
        }
    }
}
