//! Local mirror of the joined room
//!
//! Every update is keyed, so applying the same event twice, or receiving a
//! push event before or after the RPC completion it relates to, converges on
//! the same state. Events for a room the mirror does not hold are ignored.

use super::events::SessionEvent;
use super::types::{Participant, RoomState};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Default)]
pub struct RoomMirror {
    room: Option<RoomState>,
    /// Participants that dropped and may come back (`UserDisconnected`)
    awaiting_reconnect: HashMap<String, Participant>,
    /// userId of the local participant, set by join/reconnect
    local_user: Option<String>,
}

impl RoomMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the mirror with an authoritative server copy
    pub fn replace(&mut self, room: RoomState, local_user: Option<&str>) {
        self.awaiting_reconnect
            .retain(|user_id, _| !room.participants.contains_key(user_id));
        self.room = Some(room);
        if let Some(user) = local_user {
            self.local_user = Some(user.to_string());
        }
    }

    pub fn clear(&mut self) {
        self.room = None;
        self.awaiting_reconnect.clear();
        self.local_user = None;
    }

    pub fn room(&self) -> Option<&RoomState> {
        self.room.as_ref()
    }

    pub fn call_id(&self) -> Option<&str> {
        self.room.as_ref().map(|room| room.call_id.as_str())
    }

    pub fn holds_call(&self, call_id: &str) -> bool {
        self.call_id() == Some(call_id)
    }

    pub fn participant(&self, user_id: &str) -> Option<&Participant> {
        self.room.as_ref()?.participants.get(user_id)
    }

    pub fn is_awaiting_reconnect(&self, user_id: &str) -> bool {
        self.awaiting_reconnect.contains_key(user_id)
    }

    pub fn local_user(&self) -> Option<&str> {
        self.local_user.as_deref()
    }

    /// Connection id of the local participant
    pub fn local_connection_id(&self) -> Option<&str> {
        let user = self.local_user.as_deref()?;
        self.participant(user)
            .map(|p| p.connection_id.as_str())
            .filter(|id| !id.is_empty())
    }

    /// Apply a push event; returns whether the mirror changed
    pub fn apply(&mut self, event: &SessionEvent) -> bool {
        let Some(room) = self.room.as_mut() else {
            return false;
        };

        match event {
            SessionEvent::UserJoined(participant) => {
                self.awaiting_reconnect.remove(&participant.user_id);
                let previous = room
                    .participants
                    .insert(participant.user_id.clone(), participant.clone());
                previous.as_ref() != Some(participant)
            }
            SessionEvent::UserLeft(left) => {
                self.awaiting_reconnect.remove(&left.user_id);
                room.participants.remove(&left.user_id).is_some()
            }
            SessionEvent::UserDisconnected(dropped) => {
                match room.participants.remove(&dropped.user_id) {
                    Some(participant) => {
                        self.awaiting_reconnect
                            .insert(dropped.user_id.clone(), participant);
                        true
                    }
                    None => false,
                }
            }
            SessionEvent::UserReconnected(back) => {
                if let Some(participant) = room.participants.get_mut(&back.user_id) {
                    let changed = participant.connection_id != back.connection_id;
                    participant.connection_id = back.connection_id.clone();
                    return changed;
                }
                match self.awaiting_reconnect.remove(&back.user_id) {
                    Some(mut participant) => {
                        participant.connection_id = back.connection_id.clone();
                        room.participants.insert(back.user_id.clone(), participant);
                        true
                    }
                    None => {
                        debug!(
                            "Reconnect for unknown participant {} in {}",
                            back.user_id, room.call_id
                        );
                        false
                    }
                }
            }
            SessionEvent::MediaStateChanged(change) => {
                let Some(participant) = room.participants.get_mut(&change.user_id) else {
                    return false;
                };
                let before = (participant.audio_enabled, participant.video_enabled);
                if let Some(audio) = change.audio_enabled {
                    participant.audio_enabled = audio;
                }
                if let Some(video) = change.video_enabled {
                    participant.video_enabled = video;
                }
                before != (participant.audio_enabled, participant.video_enabled)
            }
            SessionEvent::NetworkQualityChanged(change) => {
                match room.participants.get_mut(&change.user_id) {
                    Some(participant) if participant.quality != Some(change.quality) => {
                        participant.quality = Some(change.quality);
                        true
                    }
                    _ => false,
                }
            }
            SessionEvent::UserTyping(typing) => match room.participants.get_mut(&typing.user_id) {
                Some(participant) if participant.is_typing != typing.is_typing => {
                    participant.is_typing = typing.is_typing;
                    true
                }
                _ => false,
            },
            SessionEvent::ScreenshareStarted(share) | SessionEvent::ScreenshareStopped(share) => {
                if share.call_id.as_deref().is_some_and(|id| id != room.call_id) {
                    return false;
                }
                let sharing = matches!(event, SessionEvent::ScreenshareStarted(_));
                match room.participants.get_mut(&share.user_id) {
                    Some(participant) if participant.is_screen_sharing != sharing => {
                        participant.is_screen_sharing = sharing;
                        true
                    }
                    _ => false,
                }
            }
            // Relayed untouched
            SessionEvent::ReceiveOffer(_)
            | SessionEvent::ReceiveAnswer(_)
            | SessionEvent::ReceiveIceCandidate(_)
            | SessionEvent::ReceiveChatMessage(_)
            | SessionEvent::RecordingStarted(_)
            | SessionEvent::RecordingStopped(_)
            | SessionEvent::RecordingConsentReceived(_) => false,
        }
    }
}
