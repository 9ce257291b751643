//! Presence Hub: live presence for a dynamic contact set
//!
//! Runs on its own [`HubConnection`], independent of the session channel.
//! The hub keeps two sets of contact ids:
//!
//! - *requested*: what the caller asked to follow; changed only by the
//!   subscribe/unsubscribe calls and by `disconnect`
//! - *confirmed*: ids the server acknowledged on the current connection;
//!   cleared and rebuilt from the requested set every time the channel is
//!   restored
//!
//! A resubscribe cut short by another drop therefore loses nothing: the next
//! restore starts again from the requested set. Every mutation, including
//! the restore-time resubscribe, runs under one async guard so bulk
//! operations and resubscription never interleave. Per-id RPCs inside a bulk
//! operation still run concurrently.

pub mod events;

pub use events::{ContactNotice, PresenceEvent, PresenceEventKind, PresenceStatus, PresenceUpdate};

use crate::config::ChannelConfig;
use crate::connection::{
    ConnectionState, HubConnection, LifecycleEvent, LifecycleEventKind, PushHandler,
};
use crate::listeners::{ListenerHandle, ListenerRegistry};
use crate::transport::{Connector, TokenProvider};
use crate::{Error, Result};
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Hub method names used by the presence channel
pub mod methods {
    pub const UPDATE_PRESENCE: &str = "UpdatePresence";
    pub const SUBSCRIBE_TO_CONTACT: &str = "SubscribeToContact";
    pub const UNSUBSCRIBE_FROM_CONTACT: &str = "UnsubscribeFromContact";
}

#[derive(Debug, Default)]
struct ContactSets {
    requested: HashSet<String>,
    confirmed: HashSet<String>,
}

impl ContactSets {
    fn record_subscribed(&mut self, contact_id: &str) {
        self.requested.insert(contact_id.to_string());
        self.confirmed.insert(contact_id.to_string());
    }

    fn record_unsubscribed(&mut self, contact_id: &str) {
        self.requested.remove(contact_id);
        self.confirmed.remove(contact_id);
    }

    fn clear(&mut self) {
        self.requested.clear();
        self.confirmed.clear();
    }
}

/// Contact sets plus the guard serializing their mutation
#[derive(Default)]
struct ContactBook {
    sets: Mutex<ContactSets>,
    guard: tokio::sync::Mutex<()>,
}

impl ContactBook {
    fn is_confirmed(&self, contact_id: &str) -> bool {
        self.sets.lock().confirmed.contains(contact_id)
    }
}

/// Presence client
pub struct PresenceHub {
    connection: Arc<HubConnection>,
    book: Arc<ContactBook>,
    events: ListenerRegistry<PresenceEvent>,
}

impl std::fmt::Debug for PresenceHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceHub")
            .field("connection", &self.connection)
            .field("subscribed", &self.book.sets.lock().confirmed.len())
            .finish()
    }
}

impl PresenceHub {
    pub fn new(
        config: ChannelConfig,
        connector: Arc<dyn Connector>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self> {
        let connection = Arc::new(HubConnection::new(config, connector, tokens)?);
        let book = Arc::new(ContactBook::default());
        let events = ListenerRegistry::new();

        connection.set_push_handler(push_handler(events.clone()));

        let weak_connection = Arc::downgrade(&connection);
        let hook_book = Arc::clone(&book);
        connection.on_restored(move || {
            resubscribe_all(weak_connection.clone(), Arc::clone(&hook_book))
        });

        Ok(Self {
            connection,
            book,
            events,
        })
    }

    // ========================================================================
    // Channel lifecycle
    // ========================================================================

    pub async fn connect(&self) -> Result<()> {
        self.connection.connect().await
    }

    /// Close the channel and forget every subscription
    ///
    /// Server-side subscriptions do not survive the connection, so the local
    /// record is cleared as well.
    pub async fn disconnect(&self) {
        self.connection.disconnect().await;

        let _guard = self.book.guard.lock().await;
        let mut sets = self.book.sets.lock();
        if !sets.requested.is_empty() {
            debug!("Dropping {} presence subscription(s)", sets.requested.len());
        }
        sets.clear();
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

    pub fn on<F>(&self, kind: PresenceEventKind, callback: F) -> ListenerHandle
    where
        F: Fn(&PresenceEvent) + Send + Sync + 'static,
    {
        self.events.on(kind, callback)
    }

    pub fn on_any<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&PresenceEvent) + Send + Sync + 'static,
    {
        self.events.on_any(callback)
    }

    pub fn events(&self) -> &ListenerRegistry<PresenceEvent> {
        &self.events
    }

    // ========================================================================
    // Presence
    // ========================================================================

    /// Publish the local user's status
    ///
    /// Unlike the subscription calls this fails loudly when the channel is
    /// not connected.
    pub async fn update_presence(&self, status: PresenceStatus) -> Result<()> {
        if !self.connection.is_connected() {
            error!(
                "Cannot update presence to {:?}: presence channel is {}",
                status,
                self.connection.state()
            );
            return Err(Error::NotConnected);
        }

        self.connection
            .invoke_void(methods::UPDATE_PRESENCE, vec![json!(status)])
            .await
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Sorted snapshot of contact ids confirmed on the current connection
    pub fn subscribed_contacts(&self) -> Vec<String> {
        let mut contacts: Vec<String> = self.book.sets.lock().confirmed.iter().cloned().collect();
        contacts.sort();
        contacts
    }

    /// Sorted snapshot of contact ids the caller asked to follow
    ///
    /// Differs from [`subscribed_contacts`](Self::subscribed_contacts) only
    /// while a resubscribe is pending or after one partially failed.
    pub fn requested_contacts(&self) -> Vec<String> {
        let mut contacts: Vec<String> = self.book.sets.lock().requested.iter().cloned().collect();
        contacts.sort();
        contacts
    }

    pub fn is_subscribed(&self, contact_id: &str) -> bool {
        self.book.is_confirmed(contact_id)
    }

    /// Subscribe to one contact; a no-op if already subscribed
    pub async fn subscribe_to_contact(&self, contact_id: &str) -> Result<()> {
        let _guard = self.book.guard.lock().await;

        if self.book.is_confirmed(contact_id) {
            debug!("Already subscribed to {}", contact_id);
            return Ok(());
        }

        subscribe_one(&self.connection, contact_id).await?;
        self.book.sets.lock().record_subscribed(contact_id);
        debug!("Subscribed to {}", contact_id);
        Ok(())
    }

    /// Unsubscribe from one contact; a no-op if not subscribed
    ///
    /// A contact that was requested but not confirmed on this connection is
    /// forgotten without an RPC.
    pub async fn unsubscribe_from_contact(&self, contact_id: &str) -> Result<()> {
        let _guard = self.book.guard.lock().await;

        if !self.book.is_confirmed(contact_id) {
            if self.book.sets.lock().requested.remove(contact_id) {
                debug!("Dropped pending subscription to {}", contact_id);
            } else {
                debug!("Not subscribed to {}", contact_id);
            }
            return Ok(());
        }

        unsubscribe_one(&self.connection, contact_id).await?;
        self.book.sets.lock().record_unsubscribed(contact_id);
        debug!("Unsubscribed from {}", contact_id);
        Ok(())
    }

    /// Subscribe to several contacts concurrently
    ///
    /// Every RPC is awaited. Successful ids are recorded even when others
    /// fail; the first failure is returned.
    pub async fn subscribe_to_contacts<I, S>(&self, contact_ids: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let _guard = self.book.guard.lock().await;

        let wanted: BTreeSet<String> = {
            let sets = self.book.sets.lock();
            contact_ids
                .into_iter()
                .map(|id| id.as_ref().to_string())
                .filter(|id| !sets.confirmed.contains(id))
                .collect()
        };
        if wanted.is_empty() {
            debug!("All requested contacts already subscribed");
            return Ok(());
        }

        let connection = &self.connection;
        let results = join_all(wanted.iter().map(|id| async move {
            (id, subscribe_one(connection, id).await)
        }))
        .await;

        let mut first_error = None;
        {
            let mut sets = self.book.sets.lock();
            for (id, result) in results {
                match result {
                    Ok(()) => sets.record_subscribed(id),
                    Err(e) => {
                        first_error.get_or_insert(e);
                    }
                }
            }
        }

        info!("Subscribed to {} contact(s)", wanted.len());
        first_error.map_or(Ok(()), Err)
    }

    /// Unsubscribe from every recorded contact concurrently
    pub async fn unsubscribe_from_all(&self) -> Result<()> {
        let _guard = self.book.guard.lock().await;

        let current: Vec<String> = {
            let mut sets = self.book.sets.lock();
            let confirmed = sets.confirmed.clone();
            sets.requested.retain(|id| confirmed.contains(id));
            confirmed.into_iter().collect()
        };
        if current.is_empty() {
            return Ok(());
        }

        let connection = &self.connection;
        let results = join_all(current.iter().map(|id| async move {
            (id, unsubscribe_one(connection, id).await)
        }))
        .await;

        let mut first_error = None;
        {
            let mut sets = self.book.sets.lock();
            for (id, result) in results {
                match result {
                    Ok(()) => sets.record_unsubscribed(id),
                    Err(e) => {
                        first_error.get_or_insert(e);
                    }
                }
            }
        }

        info!("Unsubscribed from {} contact(s)", current.len());
        first_error.map_or(Ok(()), Err)
    }
}

async fn subscribe_one(connection: &HubConnection, contact_id: &str) -> Result<()> {
    connection
        .invoke_void(methods::SUBSCRIBE_TO_CONTACT, vec![json!(contact_id)])
        .await
        .map_err(|e| subscription_error(contact_id, "subscribe to", e))
}

async fn unsubscribe_one(connection: &HubConnection, contact_id: &str) -> Result<()> {
    connection
        .invoke_void(methods::UNSUBSCRIBE_FROM_CONTACT, vec![json!(contact_id)])
        .await
        .map_err(|e| subscription_error(contact_id, "unsubscribe from", e))
}

fn subscription_error(contact_id: &str, action: &str, e: Error) -> Error {
    if e.is_not_connected() {
        return e;
    }
    error!("Failed to {} {}: {}", action, contact_id, e);
    Error::SubscriptionFailed {
        contact_id: contact_id.to_string(),
        message: e.to_string(),
    }
}

/// Rebuild server-side subscriptions after the channel is restored
///
/// The confirmed set is cleared before any RPC is issued, so a partial
/// failure leaves it holding only ids that were actually resubscribed. The
/// requested set is left alone; ids missing from the confirmed set are tried
/// again on the next restore.
async fn resubscribe_all(connection: Weak<HubConnection>, book: Arc<ContactBook>) {
    let Some(connection) = connection.upgrade() else {
        return;
    };

    let _guard = book.guard.lock().await;

    let requested: Vec<String> = {
        let mut sets = book.sets.lock();
        sets.confirmed.clear();
        sets.requested.iter().cloned().collect()
    };
    if requested.is_empty() {
        return;
    }
    info!("Resubscribing to {} contact(s)", requested.len());

    let connection = &connection;
    let results = join_all(requested.iter().map(|id| async move {
        (id, subscribe_one(connection, id).await)
    }))
    .await;

    let mut sets = book.sets.lock();
    let mut failed = 0;
    for (id, result) in results {
        match result {
            Ok(()) => {
                sets.confirmed.insert(id.clone());
            }
            Err(e) => {
                failed += 1;
                warn!("Resubscribe to {} failed: {}", id, e);
            }
        }
    }

    if failed > 0 {
        warn!(
            "Resubscribed to {}/{} contact(s)",
            sets.confirmed.len(),
            requested.len()
        );
    }
}

fn push_handler(events: ListenerRegistry<PresenceEvent>) -> PushHandler {
    Arc::new(move |target: &str, arguments: Vec<Value>| {
        match PresenceEvent::from_push(target, arguments) {
            Ok(Some(event)) => {
                events.emit(&event);
            }
            Ok(None) => debug!("Ignoring unknown presence event {}", target),
            Err(e) => warn!("Dropping malformed {} event: {}", target, e),
        }
    })
}
