//! Application-scoped owner of both channels
//!
//! Build one [`RealtimeContext`] when the user session starts, hand references
//! to whatever needs call signaling or presence, and call
//! [`RealtimeContext::shutdown`] when the user session ends.

use crate::config::ContextConfig;
use crate::connection::ConnectionState;
use crate::presence::PresenceHub;
use crate::session::SessionCoordinator;
use crate::transport::{Connector, TokenProvider};
use crate::Result;
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of [`RealtimeContext::start`], one entry per channel
#[derive(Debug)]
pub struct StartReport {
    pub session: Result<()>,
    pub presence: Result<()>,
}

impl StartReport {
    pub fn all_connected(&self) -> bool {
        self.session.is_ok() && self.presence.is_ok()
    }
}

#[derive(Debug)]
pub struct RealtimeContext {
    session: SessionCoordinator,
    presence: PresenceHub,
}

impl RealtimeContext {
    /// Build both channels; nothing is connected yet
    pub fn new(
        config: ContextConfig,
        connector: Arc<dyn Connector>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self> {
        config.validate()?;

        let session =
            SessionCoordinator::new(config.session, Arc::clone(&connector), Arc::clone(&tokens))?;
        let presence = PresenceHub::new(config.presence, connector, tokens)?;

        Ok(Self { session, presence })
    }

    pub fn session(&self) -> &SessionCoordinator {
        &self.session
    }

    pub fn presence(&self) -> &PresenceHub {
        &self.presence
    }

    /// Connect both channels concurrently
    ///
    /// A failure on one channel does not stop the other; a failed channel
    /// keeps retrying in the background per its reconnection policy.
    pub async fn start(&self) -> StartReport {
        let (session, presence) = tokio::join!(self.session.connect(), self.presence.connect());

        if let Err(e) = &session {
            warn!("Session channel did not connect: {}", e);
        }
        if let Err(e) = &presence {
            warn!("Presence channel did not connect: {}", e);
        }
        info!(
            "Realtime context started (session: {}, presence: {})",
            self.session.state(),
            self.presence.state()
        );

        StartReport { session, presence }
    }

    /// Disconnect both channels and drop presence bookkeeping
    pub async fn shutdown(&self) {
        tokio::join!(self.session.disconnect(), self.presence.disconnect());
        info!("Realtime context shut down");
    }

    pub fn states(&self) -> (ConnectionState, ConnectionState) {
        (self.session.state(), self.presence.state())
    }
}
