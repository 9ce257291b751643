//! Session Coordinator: call-session RPCs over the session channel
//!
//! Every operation requires the channel to be Connected and otherwise fails
//! with [`crate::Error::NotConnected`]. Server push events update the local
//! [`RoomMirror`] first and are then fanned out to registered listeners.
//!
//! The coordinator never rejoins a call on its own after the channel is
//! restored; callers listen for [`LifecycleEvent::Restored`] and decide
//! whether to call [`SessionCoordinator::reconnect_to_call`].
//!
//! [`LifecycleEvent::Restored`]: crate::connection::LifecycleEvent::Restored

pub mod events;
pub mod mirror;
pub mod types;

pub use events::{SessionEvent, SessionEventKind};
pub use mirror::RoomMirror;
pub use types::{
    CallQualityReport, ChatMessage, ChatMessageType, IceCandidateMessage, IceConfiguration,
    IceServer, NegotiationMessage, NetworkQuality, NetworkStats, Participant, RoomState,
    SdpMessage,
};

use crate::config::ChannelConfig;
use crate::connection::{
    ConnectionState, HubConnection, LifecycleEvent, LifecycleEventKind, PushHandler,
};
use crate::listeners::{ListenerHandle, ListenerRegistry};
use crate::transport::{Connector, TokenProvider};
use crate::Result;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Hub method names used by the session channel
pub mod methods {
    pub const JOIN_CALL: &str = "JoinCall";
    pub const LEAVE_CALL: &str = "LeaveCall";
    pub const GET_ROOM_STATE: &str = "GetRoomState";
    pub const RECONNECT_TO_CALL: &str = "ReconnectToCall";
    pub const SEND_OFFER: &str = "SendOffer";
    pub const SEND_ANSWER: &str = "SendAnswer";
    pub const SEND_ICE_CANDIDATE: &str = "SendIceCandidate";
    pub const GET_ICE_CONFIGURATION: &str = "GetIceConfiguration";
    pub const UPDATE_MEDIA_STATE: &str = "UpdateMediaState";
    pub const SEND_TYPING: &str = "SendTyping";
    pub const UPDATE_NETWORK_QUALITY: &str = "UpdateNetworkQuality";
    pub const SEND_CHAT_MESSAGE: &str = "SendChatMessage";
    pub const GET_CHAT_HISTORY: &str = "GetChatHistory";
    pub const START_SCREENSHARE: &str = "StartScreenshare";
    pub const STOP_SCREENSHARE: &str = "StopScreenshare";
    pub const START_RECORDING: &str = "StartRecording";
    pub const STOP_RECORDING: &str = "StopRecording";
    pub const SUBMIT_RECORDING_CONSENT: &str = "SubmitRecordingConsent";
    pub const SUBMIT_CALL_QUALITY_REPORT: &str = "SubmitCallQualityReport";
}

/// Call signaling client
pub struct SessionCoordinator {
    connection: HubConnection,
    mirror: Arc<RwLock<RoomMirror>>,
    events: ListenerRegistry<SessionEvent>,
}

impl std::fmt::Debug for SessionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCoordinator")
            .field("connection", &self.connection)
            .field("call_id", &self.mirror.read().call_id())
            .finish()
    }
}

impl SessionCoordinator {
    pub fn new(
        config: ChannelConfig,
        connector: Arc<dyn Connector>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self> {
        let connection = HubConnection::new(config, connector, tokens)?;
        let mirror = Arc::new(RwLock::new(RoomMirror::new()));
        let events = ListenerRegistry::new();

        connection.set_push_handler(push_handler(Arc::clone(&mirror), events.clone()));

        Ok(Self {
            connection,
            mirror,
            events,
        })
    }

    // ========================================================================
    // Channel lifecycle
    // ========================================================================

    pub async fn connect(&self) -> Result<()> {
        self.connection.connect().await
    }

    /// Close the channel; the room mirror is kept until `leave_call`
    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch_state()
    }

    pub fn connection(&self) -> &HubConnection {
        &self.connection
    }

    pub fn on_lifecycle<F>(&self, kind: LifecycleEventKind, callback: F) -> ListenerHandle
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.connection.on_lifecycle(kind, callback)
    }

    // ========================================================================
    // Event registration
    // ========================================================================

    /// Register a callback for one push event kind
    pub fn on<F>(&self, kind: SessionEventKind, callback: F) -> ListenerHandle
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.events.on(kind, callback)
    }

    /// Register a callback for every push event
    pub fn on_any<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.events.on_any(callback)
    }

    pub fn events(&self) -> &ListenerRegistry<SessionEvent> {
        &self.events
    }

    // ========================================================================
    // Mirror
    // ========================================================================

    /// Snapshot of the mirrored room
    pub fn room(&self) -> Option<RoomState> {
        self.mirror.read().room().cloned()
    }

    pub fn participant(&self, user_id: &str) -> Option<Participant> {
        self.mirror.read().participant(user_id).cloned()
    }

    /// Connection id of the local participant, kept across channel drops
    pub fn connection_id(&self) -> Option<String> {
        self.mirror.read().local_connection_id().map(str::to_string)
    }

    // ========================================================================
    // Room membership
    // ========================================================================

    /// Join a call and overwrite the mirror with the returned room
    pub async fn join_call(
        &self,
        call_id: &str,
        user_id: &str,
        display_name: &str,
        audio_enabled: bool,
        video_enabled: bool,
    ) -> Result<RoomState> {
        let room: RoomState = self
            .connection
            .invoke(
                methods::JOIN_CALL,
                vec![
                    json!(call_id),
                    json!(user_id),
                    json!(display_name),
                    json!(audio_enabled),
                    json!(video_enabled),
                ],
            )
            .await?;

        info!(
            "Joined call {} as {} ({} participant(s))",
            call_id,
            user_id,
            room.participant_count()
        );
        self.mirror.write().replace(room.clone(), Some(user_id));
        Ok(room)
    }

    pub async fn leave_call(&self, call_id: &str, user_id: &str, reason: Option<&str>) -> Result<()> {
        self.connection
            .invoke_void(
                methods::LEAVE_CALL,
                vec![json!(call_id), json!(user_id), json!(reason)],
            )
            .await?;

        let mut mirror = self.mirror.write();
        if mirror.holds_call(call_id) {
            mirror.clear();
        }
        info!("Left call {}", call_id);
        Ok(())
    }

    /// Fetch the authoritative room and refresh the mirror
    ///
    /// `None` means the server no longer knows the call.
    pub async fn get_room_state(&self, call_id: &str) -> Result<Option<RoomState>> {
        let room: Option<RoomState> = self
            .connection
            .invoke(methods::GET_ROOM_STATE, vec![json!(call_id)])
            .await?;

        let mut mirror = self.mirror.write();
        match &room {
            Some(room) if mirror.holds_call(call_id) || mirror.room().is_none() => {
                mirror.replace(room.clone(), None);
            }
            Some(_) => debug!("Not mirroring {}: another call is active", call_id),
            None if mirror.holds_call(call_id) => {
                warn!("Call {} no longer exists on the server", call_id);
                mirror.clear();
            }
            None => {}
        }
        Ok(room)
    }

    /// Resume a room after the channel was restored
    pub async fn reconnect_to_call(
        &self,
        call_id: &str,
        user_id: &str,
        previous_connection_id: &str,
    ) -> Result<RoomState> {
        let room: RoomState = self
            .connection
            .invoke(
                methods::RECONNECT_TO_CALL,
                vec![json!(call_id), json!(user_id), json!(previous_connection_id)],
            )
            .await?;

        info!(
            "Resumed call {} as {} (previous connection {})",
            call_id, user_id, previous_connection_id
        );
        self.mirror.write().replace(room.clone(), Some(user_id));
        Ok(room)
    }

    // ========================================================================
    // Negotiation relay
    // ========================================================================

    pub async fn send_offer(&self, offer: &SdpMessage) -> Result<()> {
        self.relay_sdp(methods::SEND_OFFER, offer).await
    }

    pub async fn send_answer(&self, answer: &SdpMessage) -> Result<()> {
        self.relay_sdp(methods::SEND_ANSWER, answer).await
    }

    pub async fn send_ice_candidate(&self, candidate: &IceCandidateMessage) -> Result<()> {
        self.connection
            .invoke_void(
                methods::SEND_ICE_CANDIDATE,
                vec![
                    json!(candidate.call_id),
                    json!(candidate.from_user_id),
                    json!(candidate.to_user_id),
                    json!(candidate.candidate),
                    json!(candidate.sdp_mid),
                    json!(candidate.sdp_m_line_index),
                ],
            )
            .await
    }

    /// Relay any negotiation artifact
    pub async fn send_negotiation(&self, message: &NegotiationMessage) -> Result<()> {
        match message {
            NegotiationMessage::Offer(offer) => self.send_offer(offer).await,
            NegotiationMessage::Answer(answer) => self.send_answer(answer).await,
            NegotiationMessage::IceCandidate(candidate) => self.send_ice_candidate(candidate).await,
        }
    }

    async fn relay_sdp(&self, method: &str, message: &SdpMessage) -> Result<()> {
        self.connection
            .invoke_void(
                method,
                vec![
                    json!(message.call_id),
                    json!(message.from_user_id),
                    json!(message.to_user_id),
                    json!(message.sdp),
                ],
            )
            .await
    }

    pub async fn get_ice_configuration(&self) -> Result<IceConfiguration> {
        self.connection
            .invoke(methods::GET_ICE_CONFIGURATION, vec![])
            .await
    }

    // ========================================================================
    // In-call state
    // ========================================================================

    pub async fn update_media_state(
        &self,
        call_id: &str,
        user_id: &str,
        audio_enabled: Option<bool>,
        video_enabled: Option<bool>,
    ) -> Result<()> {
        self.connection
            .invoke_void(
                methods::UPDATE_MEDIA_STATE,
                vec![
                    json!(call_id),
                    json!(user_id),
                    json!(audio_enabled),
                    json!(video_enabled),
                ],
            )
            .await
    }

    pub async fn send_typing(
        &self,
        call_id: &str,
        user_id: &str,
        display_name: &str,
        is_typing: bool,
    ) -> Result<()> {
        self.connection
            .invoke_void(
                methods::SEND_TYPING,
                vec![
                    json!(call_id),
                    json!(user_id),
                    json!(display_name),
                    json!(is_typing),
                ],
            )
            .await
    }

    pub async fn update_network_quality(
        &self,
        call_id: &str,
        user_id: &str,
        quality: NetworkQuality,
        stats: Option<&NetworkStats>,
    ) -> Result<()> {
        self.connection
            .invoke_void(
                methods::UPDATE_NETWORK_QUALITY,
                vec![json!(call_id), json!(user_id), json!(quality), json!(stats)],
            )
            .await
    }

    pub async fn send_chat_message(
        &self,
        call_id: &str,
        content: &str,
        message_type: ChatMessageType,
        reply_to_id: Option<&str>,
    ) -> Result<()> {
        self.connection
            .invoke_void(
                methods::SEND_CHAT_MESSAGE,
                vec![
                    json!(call_id),
                    json!(content),
                    json!(message_type),
                    json!(reply_to_id),
                ],
            )
            .await
    }

    pub async fn get_chat_history(
        &self,
        call_id: &str,
        skip: u32,
        limit: u32,
    ) -> Result<Vec<ChatMessage>> {
        let history: Option<Vec<ChatMessage>> = self
            .connection
            .invoke(
                methods::GET_CHAT_HISTORY,
                vec![json!(call_id), json!(skip), json!(limit)],
            )
            .await?;
        Ok(history.unwrap_or_default())
    }

    // ========================================================================
    // Screen share and recording
    // ========================================================================

    pub async fn start_screenshare(&self, call_id: &str) -> Result<()> {
        self.connection
            .invoke_void(methods::START_SCREENSHARE, vec![json!(call_id)])
            .await
    }

    pub async fn stop_screenshare(&self, call_id: &str) -> Result<()> {
        self.connection
            .invoke_void(methods::STOP_SCREENSHARE, vec![json!(call_id)])
            .await
    }

    /// Start recording; returns the recording id
    pub async fn start_recording(&self, call_id: &str, require_consent: bool) -> Result<String> {
        let recording_id: String = self
            .connection
            .invoke(
                methods::START_RECORDING,
                vec![json!(call_id), json!(require_consent)],
            )
            .await?;
        info!("Recording {} started in {}", recording_id, call_id);
        Ok(recording_id)
    }

    pub async fn stop_recording(&self, call_id: &str, recording_id: &str) -> Result<()> {
        self.connection
            .invoke_void(
                methods::STOP_RECORDING,
                vec![json!(call_id), json!(recording_id)],
            )
            .await
    }

    pub async fn submit_recording_consent(
        &self,
        call_id: &str,
        recording_id: &str,
        user_id: &str,
        consent: bool,
    ) -> Result<()> {
        self.connection
            .invoke_void(
                methods::SUBMIT_RECORDING_CONSENT,
                vec![
                    json!(call_id),
                    json!(recording_id),
                    json!(user_id),
                    json!(consent),
                ],
            )
            .await
    }

    pub async fn submit_call_quality_report(&self, report: &CallQualityReport) -> Result<()> {
        let report = serde_json::to_value(report)?;
        self.connection
            .invoke_void(methods::SUBMIT_CALL_QUALITY_REPORT, vec![report])
            .await
    }
}

/// Decode, mirror, then fan out
fn push_handler(
    mirror: Arc<RwLock<RoomMirror>>,
    events: ListenerRegistry<SessionEvent>,
) -> PushHandler {
    Arc::new(move |target: &str, arguments: Vec<Value>| {
        let event = match SessionEvent::from_push(target, arguments) {
            Ok(Some(event)) => event,
            Ok(None) => {
                debug!("Ignoring unknown session event {}", target);
                return;
            }
            Err(e) => {
                warn!("Dropping malformed {} event: {}", target, e);
                return;
            }
        };

        if mirror.write().apply(&event) {
            debug!("Room mirror updated by {}", target);
        }
        events.emit(&event);
    })
}
