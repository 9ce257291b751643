//! Hub channel test harness
//!
//! Provides an in-memory hub for integration testing of the session and
//! presence clients:
//! - [`MockHub`] implements `Connector`, answers the handshake and pings,
//!   records every invocation and answers it from scripted responders
//! - push events, link drops, server close records and refused connects can
//!   be injected at any time
//!
//! Tests run on a paused tokio clock (`start_paused = true`), so backoff
//! delays are asserted against virtual time.

#![allow(dead_code)]

pub mod mock_hub;

use callhub_signaling::{ChannelConfig, ConnectionState, Connector, Event, ListenerRegistry, TransportLink};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub use mock_hub::{Invocation, MockHub};

/// Result type for test harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Error type for test harness operations
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("No open link")]
    NoLink,

    #[error("Link closed: {0}")]
    LinkClosed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Session channel config pointing at the mock hub
pub fn session_config() -> ChannelConfig {
    ChannelConfig::session("ws://mock.hub/hubs/call")
}

/// Presence channel config pointing at the mock hub
pub fn presence_config() -> ChannelConfig {
    ChannelConfig::presence("ws://mock.hub/hubs/presence")
}

/// Let spawned tasks run until they block again
///
/// Advances the paused clock by a millisecond, which is far below every
/// timeout and backoff the tests care about.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Wait for `target`, failing after `limit` of virtual time
pub async fn wait_for_state(
    mut rx: watch::Receiver<ConnectionState>,
    target: ConnectionState,
    limit: Duration,
) -> HarnessResult<()> {
    tokio::time::timeout(limit, rx.wait_for(|state| *state == target))
        .await
        .map_err(|_| HarnessError::Timeout(format!("state {} not reached", target)))?
        .map(|_| ())
        .map_err(|_| HarnessError::LinkClosed("state sender dropped".to_string()))
}

/// Records every event delivered through a registry
pub struct EventLog<E: Event + Clone> {
    events: Arc<Mutex<Vec<E>>>,
    _handle: callhub_signaling::ListenerHandle,
}

impl<E: Event + Clone> EventLog<E> {
    pub fn attach(registry: &ListenerRegistry<E>) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let handle = registry.on_any(move |event: &E| sink.lock().push(event.clone()));
        Self {
            events,
            _handle: handle,
        }
    }

    pub fn snapshot(&self) -> Vec<E> {
        self.events.lock().clone()
    }

    pub fn count(&self, kind: E::Kind) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| event.kind() == kind)
            .count()
    }
}

/// Connector routing each channel to its own hub by channel name
pub struct RoutedConnector {
    pub session: MockHub,
    pub presence: MockHub,
}

#[async_trait::async_trait]
impl Connector for RoutedConnector {
    async fn open(
        &self,
        config: &ChannelConfig,
        access_token: Option<&str>,
    ) -> callhub_signaling::Result<TransportLink> {
        match config.name.as_str() {
            "session" => self.session.open(config, access_token).await,
            _ => self.presence.open(config, access_token).await,
        }
    }
}
