//! Real-time call signaling and presence coordination
//!
//! This crate keeps two persistent hub channels open to a coordination
//! endpoint and layers call-session and presence semantics on top of them.
//!
//! # Features
//!
//! - **Connection lifecycle**: explicit state machine with exponential-backoff
//!   reconnection and an attempt budget per channel
//! - **Session coordination**: join/leave/resume calls, relay WebRTC offers,
//!   answers and ICE candidates, mirror room state from push events
//! - **Presence**: publish status, track a subscribed contact set and
//!   resubscribe after the channel is restored
//! - **Typed fan-out**: push events delivered to independently registered
//!   listeners, each removable through its own handle
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  RealtimeContext                                     │
//! │  ├─ SessionCoordinator ──┐                           │
//! │  │   └─ RoomMirror       │                           │
//! │  └─ PresenceHub ─────────┤                           │
//! │      └─ contact set      │                           │
//! │                          ↓                           │
//! │  HubConnection (one per channel)                     │
//! │  ├─ ReconnectionBudget                               │
//! │  ├─ ListenerRegistry<LifecycleEvent>                 │
//! │  └─ Connector ── WebSocket (hub protocol, JSON)      │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use callhub_signaling::ContextConfig;
//!
//! let config = ContextConfig::for_origin("https://calls.example.org");
//! assert!(config.validate().is_ok());
//! assert_eq!(config.presence.reconnect.cap_delay_ms, 60000);
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use callhub_signaling::{ContextConfig, RealtimeContext, StaticToken, WebSocketConnector};
//!
//! # async fn example() -> callhub_signaling::Result<()> {
//! let context = RealtimeContext::new(
//!     ContextConfig::for_origin("https://calls.example.org"),
//!     Arc::new(WebSocketConnector::new()),
//!     Arc::new(StaticToken("token".to_string())),
//! )?;
//!
//! let report = context.start().await;
//! report.session?;
//!
//! let room = context
//!     .session()
//!     .join_call("call-1", "user-1", "Ada", true, true)
//!     .await?;
//! println!("{} participant(s)", room.participant_count());
//!
//! context.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod listeners;
pub mod presence;
pub mod protocol;
pub mod reconnect;
pub mod session;
pub mod transport;

// Re-exports for public API
pub use config::{ChannelConfig, ContextConfig, TransportConfig};
pub use connection::{ConnectionState, HubConnection, LifecycleEvent, LifecycleEventKind};
pub use context::{RealtimeContext, StartReport};
pub use error::{Error, Result};
pub use listeners::{Event, ListenerHandle, ListenerRegistry};
pub use presence::{PresenceEvent, PresenceEventKind, PresenceHub, PresenceStatus};
pub use reconnect::{Backoff, ReconnectionBudget, ReconnectionPolicy};
pub use session::{RoomState, SessionCoordinator, SessionEvent, SessionEventKind};
pub use transport::{
    token_fn, Connector, NoToken, StaticToken, TokenProvider, TransportLink, WebSocketConnector,
};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        let ver = version();
        assert!(!ver.is_empty());
    }
}
