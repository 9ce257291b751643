//! Push events delivered on the session channel

use super::types::{ChatMessage, IceCandidateMessage, NetworkQuality, NetworkStats, Participant, SdpMessage};
use crate::listeners::Event;
use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserLeft {
    pub user_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Participant dropped but may come back with a new connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserDisconnected {
    pub user_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserReconnected {
    pub user_id: String,
    pub connection_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MediaStateChanged {
    pub user_id: String,
    #[serde(default)]
    pub audio_enabled: Option<bool>,
    #[serde(default)]
    pub video_enabled: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserTyping {
    pub user_id: String,
    #[serde(default)]
    pub display_name: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkQualityChanged {
    pub user_id: String,
    pub quality: NetworkQuality,
    #[serde(default)]
    pub stats: Option<NetworkStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScreenshareChanged {
    pub user_id: String,
    #[serde(default)]
    pub call_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecordingChanged {
    pub recording_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub require_consent: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecordingConsent {
    pub recording_id: String,
    pub user_id: String,
    pub consent: bool,
}

/// Every push event the session channel delivers
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    UserJoined(Participant),
    UserLeft(UserLeft),
    UserDisconnected(UserDisconnected),
    UserReconnected(UserReconnected),
    ReceiveOffer(SdpMessage),
    ReceiveAnswer(SdpMessage),
    ReceiveIceCandidate(IceCandidateMessage),
    MediaStateChanged(MediaStateChanged),
    UserTyping(UserTyping),
    NetworkQualityChanged(NetworkQualityChanged),
    ReceiveChatMessage(ChatMessage),
    ScreenshareStarted(ScreenshareChanged),
    ScreenshareStopped(ScreenshareChanged),
    RecordingStarted(RecordingChanged),
    RecordingStopped(RecordingChanged),
    RecordingConsentReceived(RecordingConsent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEventKind {
    UserJoined,
    UserLeft,
    UserDisconnected,
    UserReconnected,
    ReceiveOffer,
    ReceiveAnswer,
    ReceiveIceCandidate,
    MediaStateChanged,
    UserTyping,
    NetworkQualityChanged,
    ReceiveChatMessage,
    ScreenshareStarted,
    ScreenshareStopped,
    RecordingStarted,
    RecordingStopped,
    RecordingConsentReceived,
}

impl SessionEventKind {
    pub const ALL: [SessionEventKind; 16] = [
        SessionEventKind::UserJoined,
        SessionEventKind::UserLeft,
        SessionEventKind::UserDisconnected,
        SessionEventKind::UserReconnected,
        SessionEventKind::ReceiveOffer,
        SessionEventKind::ReceiveAnswer,
        SessionEventKind::ReceiveIceCandidate,
        SessionEventKind::MediaStateChanged,
        SessionEventKind::UserTyping,
        SessionEventKind::NetworkQualityChanged,
        SessionEventKind::ReceiveChatMessage,
        SessionEventKind::ScreenshareStarted,
        SessionEventKind::ScreenshareStopped,
        SessionEventKind::RecordingStarted,
        SessionEventKind::RecordingStopped,
        SessionEventKind::RecordingConsentReceived,
    ];

    /// Hub method name of this event
    pub fn wire_name(self) -> &'static str {
        match self {
            SessionEventKind::UserJoined => "UserJoined",
            SessionEventKind::UserLeft => "UserLeft",
            SessionEventKind::UserDisconnected => "UserDisconnected",
            SessionEventKind::UserReconnected => "UserReconnected",
            SessionEventKind::ReceiveOffer => "ReceiveOffer",
            SessionEventKind::ReceiveAnswer => "ReceiveAnswer",
            SessionEventKind::ReceiveIceCandidate => "ReceiveIceCandidate",
            SessionEventKind::MediaStateChanged => "MediaStateChanged",
            SessionEventKind::UserTyping => "UserTyping",
            SessionEventKind::NetworkQualityChanged => "NetworkQualityChanged",
            SessionEventKind::ReceiveChatMessage => "ReceiveChatMessage",
            SessionEventKind::ScreenshareStarted => "ScreenshareStarted",
            SessionEventKind::ScreenshareStopped => "ScreenshareStopped",
            SessionEventKind::RecordingStarted => "RecordingStarted",
            SessionEventKind::RecordingStopped => "RecordingStopped",
            SessionEventKind::RecordingConsentReceived => "RecordingConsentReceived",
        }
    }

    pub fn from_wire_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.wire_name() == name)
    }
}

impl Event for SessionEvent {
    type Kind = SessionEventKind;

    fn kind(&self) -> SessionEventKind {
        match self {
            SessionEvent::UserJoined(_) => SessionEventKind::UserJoined,
            SessionEvent::UserLeft(_) => SessionEventKind::UserLeft,
            SessionEvent::UserDisconnected(_) => SessionEventKind::UserDisconnected,
            SessionEvent::UserReconnected(_) => SessionEventKind::UserReconnected,
            SessionEvent::ReceiveOffer(_) => SessionEventKind::ReceiveOffer,
            SessionEvent::ReceiveAnswer(_) => SessionEventKind::ReceiveAnswer,
            SessionEvent::ReceiveIceCandidate(_) => SessionEventKind::ReceiveIceCandidate,
            SessionEvent::MediaStateChanged(_) => SessionEventKind::MediaStateChanged,
            SessionEvent::UserTyping(_) => SessionEventKind::UserTyping,
            SessionEvent::NetworkQualityChanged(_) => SessionEventKind::NetworkQualityChanged,
            SessionEvent::ReceiveChatMessage(_) => SessionEventKind::ReceiveChatMessage,
            SessionEvent::ScreenshareStarted(_) => SessionEventKind::ScreenshareStarted,
            SessionEvent::ScreenshareStopped(_) => SessionEventKind::ScreenshareStopped,
            SessionEvent::RecordingStarted(_) => SessionEventKind::RecordingStarted,
            SessionEvent::RecordingStopped(_) => SessionEventKind::RecordingStopped,
            SessionEvent::RecordingConsentReceived(_) => {
                SessionEventKind::RecordingConsentReceived
            }
        }
    }
}

fn payload<T: DeserializeOwned>(target: &str, arguments: Vec<Value>) -> Result<T> {
    let first = arguments.into_iter().next().ok_or_else(|| {
        Error::Protocol(format!("{} push event without payload", target))
    })?;
    serde_json::from_value(first)
        .map_err(|e| Error::SerializationError(format!("Invalid {} payload: {}", target, e)))
}

impl SessionEvent {
    /// Decode a push invocation
    ///
    /// Returns `Ok(None)` for targets this layer does not know.
    pub fn from_push(target: &str, arguments: Vec<Value>) -> Result<Option<Self>> {
        let Some(kind) = SessionEventKind::from_wire_name(target) else {
            return Ok(None);
        };

        let event = match kind {
            SessionEventKind::UserJoined => SessionEvent::UserJoined(payload(target, arguments)?),
            SessionEventKind::UserLeft => SessionEvent::UserLeft(payload(target, arguments)?),
            SessionEventKind::UserDisconnected => {
                SessionEvent::UserDisconnected(payload(target, arguments)?)
            }
            SessionEventKind::UserReconnected => {
                SessionEvent::UserReconnected(payload(target, arguments)?)
            }
            SessionEventKind::ReceiveOffer => {
                SessionEvent::ReceiveOffer(payload(target, arguments)?)
            }
            SessionEventKind::ReceiveAnswer => {
                SessionEvent::ReceiveAnswer(payload(target, arguments)?)
            }
            SessionEventKind::ReceiveIceCandidate => {
                SessionEvent::ReceiveIceCandidate(payload(target, arguments)?)
            }
            SessionEventKind::MediaStateChanged => {
                SessionEvent::MediaStateChanged(payload(target, arguments)?)
            }
            SessionEventKind::UserTyping => SessionEvent::UserTyping(payload(target, arguments)?),
            SessionEventKind::NetworkQualityChanged => {
                SessionEvent::NetworkQualityChanged(payload(target, arguments)?)
            }
            SessionEventKind::ReceiveChatMessage => {
                SessionEvent::ReceiveChatMessage(payload(target, arguments)?)
            }
            SessionEventKind::ScreenshareStarted => {
                SessionEvent::ScreenshareStarted(payload(target, arguments)?)
            }
            SessionEventKind::ScreenshareStopped => {
                SessionEvent::ScreenshareStopped(payload(target, arguments)?)
            }
            SessionEventKind::RecordingStarted => {
                SessionEvent::RecordingStarted(payload(target, arguments)?)
            }
            SessionEventKind::RecordingStopped => {
                SessionEvent::RecordingStopped(payload(target, arguments)?)
            }
            SessionEventKind::RecordingConsentReceived => {
                SessionEvent::RecordingConsentReceived(payload(target, arguments)?)
            }
        };

        Ok(Some(event))
    }
}
