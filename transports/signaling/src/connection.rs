//! Connection lifecycle for one persistent hub channel
//!
//! [`HubConnection`] owns the channel's state machine:
//!
//! ```text
//! Disconnected --connect()--> Connecting --success--> Connected
//! Connecting --failure--> Reconnecting (if budget remains) --success--> Connected
//! Connected --unintentional drop--> Reconnecting --success--> Connected
//! Reconnecting --budget exhausted--> Disconnected (manual connect() required)
//! any --disconnect()--> Disconnected (intentional, no retry)
//! ```
//!
//! RPCs are only issued while Connected; anything else fails fast with
//! [`Error::NotConnected`]. Push invocations are handed to the owning
//! component's handler on the reader task, in arrival order.

use crate::config::ChannelConfig;
use crate::listeners::{Event, ListenerHandle, ListenerRegistry};
use crate::protocol::{decode_frame, parse_handshake, HandshakeRequest, HubMessage};
use crate::reconnect::{Backoff, ReconnectionBudget};
use crate::transport::{Connector, TokenProvider, TransportLink};
use crate::{Error, Result};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Channel connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Lifecycle notifications published by a channel
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// A reconnect attempt is scheduled after `delay`
    Reconnecting { attempt: u32, delay: Duration },
    /// The channel is Connected again after a drop
    Restored,
    /// Terminal: the attempt budget is spent and the channel stays Disconnected
    ReconnectExhausted { attempts: u32 },
    /// Terminal: the endpoint rejected the access token
    AuthenticationRejected { message: String },
    /// The server closed the channel and asked not to reconnect
    ServerClosed { reason: Option<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEventKind {
    StateChanged,
    Reconnecting,
    Restored,
    ReconnectExhausted,
    AuthenticationRejected,
    ServerClosed,
}

impl Event for LifecycleEvent {
    type Kind = LifecycleEventKind;

    fn kind(&self) -> LifecycleEventKind {
        match self {
            LifecycleEvent::StateChanged { .. } => LifecycleEventKind::StateChanged,
            LifecycleEvent::Reconnecting { .. } => LifecycleEventKind::Reconnecting,
            LifecycleEvent::Restored => LifecycleEventKind::Restored,
            LifecycleEvent::ReconnectExhausted { .. } => LifecycleEventKind::ReconnectExhausted,
            LifecycleEvent::AuthenticationRejected { .. } => {
                LifecycleEventKind::AuthenticationRejected
            }
            LifecycleEvent::ServerClosed { .. } => LifecycleEventKind::ServerClosed,
        }
    }
}

/// Receives server push invocations (`target`, `arguments`)
pub type PushHandler = Arc<dyn Fn(&str, Vec<Value>) + Send + Sync>;

/// Resynchronisation hook run after the channel reaches Connected
pub type RestoreHook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Why a link stopped
#[derive(Debug, Clone, PartialEq)]
enum LinkClosed {
    Transport,
    ServerTimeout,
    Server {
        error: Option<String>,
        allow_reconnect: bool,
    },
}

struct PendingCall {
    method: String,
    reply: oneshot::Sender<Result<Option<Value>>>,
}

struct ActiveLink {
    generation: u64,
    outbound: mpsc::UnboundedSender<String>,
    tasks: Vec<JoinHandle<()>>,
}

impl ActiveLink {
    fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

struct Inner {
    config: ChannelConfig,
    connector: Arc<dyn Connector>,
    tokens: Arc<dyn TokenProvider>,
    state_tx: watch::Sender<ConnectionState>,
    budget: Mutex<ReconnectionBudget>,
    /// Set by disconnect(); checked before every scheduled retry
    intentional: AtomicBool,
    reconnecting: AtomicBool,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    generation: AtomicU64,
    link: Mutex<Option<ActiveLink>>,
    pending: Mutex<HashMap<String, PendingCall>>,
    next_invocation: AtomicU64,
    push_handler: RwLock<Option<PushHandler>>,
    restore_hooks: Mutex<Vec<RestoreHook>>,
    lifecycle: ListenerRegistry<LifecycleEvent>,
    connect_lock: tokio::sync::Mutex<()>,
}

/// Lifecycle manager for one hub channel
pub struct HubConnection {
    inner: Arc<Inner>,
}

impl fmt::Debug for HubConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubConnection")
            .field("name", &self.inner.config.name)
            .field("url", &self.inner.config.url)
            .field("state", &self.state())
            .finish()
    }
}

impl HubConnection {
    /// Create a channel in the Disconnected state
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the configuration does not validate.
    pub fn new(
        config: ChannelConfig,
        connector: Arc<dyn Connector>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self> {
        config.validate()?;

        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let budget = ReconnectionBudget::new(config.reconnect.clone());

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                connector,
                tokens,
                state_tx,
                budget: Mutex::new(budget),
                intentional: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
                reconnect_task: Mutex::new(None),
                generation: AtomicU64::new(0),
                link: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                next_invocation: AtomicU64::new(0),
                push_handler: RwLock::new(None),
                restore_hooks: Mutex::new(Vec::new()),
                lifecycle: ListenerRegistry::new(),
                connect_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Watch state transitions
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Wait until the channel reaches `target`
    pub async fn wait_for_state(&self, target: ConnectionState) {
        let mut rx = self.watch_state();
        // The sender lives as long as `self`, so this cannot fail while borrowed.
        let _ = rx.wait_for(|state| *state == target).await;
    }

    /// Attempts consumed since the last successful connection
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.budget.lock().attempt()
    }

    /// Install the handler for server push invocations
    pub fn set_push_handler(&self, handler: PushHandler) {
        *self.inner.push_handler.write() = Some(handler);
    }

    /// Register a hook run every time the channel reaches Connected
    pub fn on_restored<F, Fut>(&self, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let hook: RestoreHook = Arc::new(move || Box::pin(hook()));
        self.inner.restore_hooks.lock().push(hook);
    }

    /// Register a lifecycle listener
    pub fn on_lifecycle<F>(&self, kind: LifecycleEventKind, callback: F) -> ListenerHandle
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.inner.lifecycle.on(kind, callback)
    }

    pub fn lifecycle(&self) -> &ListenerRegistry<LifecycleEvent> {
        &self.inner.lifecycle
    }

    /// Open the channel
    ///
    /// A no-op when already Connected. If the first attempt fails the error is
    /// returned here and retries continue in the background per the
    /// reconnection policy; later failures are only logged and published as
    /// lifecycle events.
    pub async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        let _guard = inner.connect_lock.lock().await;

        if self.state() == ConnectionState::Connected {
            warn!("{} channel is already connected", inner.config.name);
            return Ok(());
        }

        inner.intentional.store(false, Ordering::SeqCst);
        inner.cancel_reconnect();
        inner.budget.lock().reset();
        inner.set_state(ConnectionState::Connecting);

        match inner.establish().await {
            Ok(()) => {
                info!("{} channel connected", inner.config.name);
                inner.run_restore_hooks().await;
                Ok(())
            }
            Err(e) if e.is_fatal() => {
                error!("{} channel connect rejected: {}", inner.config.name, e);
                inner.set_state(ConnectionState::Disconnected);
                inner.emit(LifecycleEvent::AuthenticationRejected {
                    message: e.to_string(),
                });
                Err(e)
            }
            Err(e) if !e.is_retryable() => {
                error!("{} channel connect failed: {}", inner.config.name, e);
                inner.set_state(ConnectionState::Disconnected);
                Err(e)
            }
            Err(e) => {
                warn!("{} channel connect failed: {}", inner.config.name, e);
                Inner::begin_reconnect(inner);
                Err(e)
            }
        }
    }

    /// Close the channel without triggering reconnection
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        inner.intentional.store(true, Ordering::SeqCst);
        inner.cancel_reconnect();

        let link = inner.link.lock().take();
        if let Some(link) = link {
            link.shutdown();
        }
        inner.fail_pending("channel disconnected");
        inner.set_state(ConnectionState::Disconnected);

        info!("{} channel disconnected", inner.config.name);
    }

    /// Invoke a hub method and return its raw result
    ///
    /// `None` means the completion carried no result (void method or `null`).
    pub async fn invoke_raw(&self, method: &str, arguments: Vec<Value>) -> Result<Option<Value>> {
        let inner = &self.inner;

        let id = inner
            .next_invocation
            .fetch_add(1, Ordering::SeqCst)
            .to_string();
        let record = HubMessage::invocation(id.as_str(), method, arguments).to_record()?;
        let (reply_tx, reply_rx) = oneshot::channel();

        // Registered under the link lock, so a concurrent close either sees
        // this call and fails it, or has already taken the link.
        let outbound = {
            let link = inner.link.lock();
            let outbound = match link.as_ref() {
                Some(link) if self.state() == ConnectionState::Connected => link.outbound.clone(),
                _ => return Err(Error::NotConnected),
            };
            inner.pending.lock().insert(
                id.clone(),
                PendingCall {
                    method: method.to_string(),
                    reply: reply_tx,
                },
            );
            outbound
        };

        trace!("{} channel: invoking {} ({})", inner.config.name, method, id);
        if outbound.send(record).is_err() {
            inner.pending.lock().remove(&id);
            return Err(Error::Transport(format!(
                "{} could not be sent: link closed",
                method
            )));
        }

        match tokio::time::timeout(inner.config.rpc_timeout(), reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Transport("connection lost".to_string())),
            Err(_) => {
                inner.pending.lock().remove(&id);
                Err(Error::Timeout(format!(
                    "{} did not complete within {:?}",
                    method,
                    inner.config.rpc_timeout()
                )))
            }
        }
    }

    /// Invoke a hub method and decode its result
    pub async fn invoke<T: DeserializeOwned>(&self, method: &str, arguments: Vec<Value>) -> Result<T> {
        let result = self.invoke_raw(method, arguments).await?;
        serde_json::from_value(result.unwrap_or(Value::Null)).map_err(|e| {
            Error::SerializationError(format!("Invalid {} result: {}", method, e))
        })
    }

    /// Invoke a hub method whose result is ignored
    pub async fn invoke_void(&self, method: &str, arguments: Vec<Value>) -> Result<()> {
        self.invoke_raw(method, arguments).await.map(|_| ())
    }
}

impl Drop for HubConnection {
    fn drop(&mut self) {
        self.inner.intentional.store(true, Ordering::SeqCst);
        self.inner.cancel_reconnect();
        if let Some(link) = self.inner.link.lock().take() {
            link.shutdown();
        }
    }
}

impl Inner {
    fn set_state(&self, next: ConnectionState) {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            debug!("{} channel: {} -> {}", self.config.name, previous, next);
            self.emit(LifecycleEvent::StateChanged {
                from: previous,
                to: next,
            });
        }
    }

    fn emit(&self, event: LifecycleEvent) {
        self.lifecycle.emit(&event);
    }

    fn cancel_reconnect(&self) {
        if let Some(task) = self.reconnect_task.lock().take() {
            task.abort();
        }
        self.reconnecting.store(false, Ordering::SeqCst);
    }

    fn fail_pending(&self, reason: &str) {
        let pending: Vec<PendingCall> = self.pending.lock().drain().map(|(_, call)| call).collect();
        for call in pending {
            debug!(
                "{} channel: failing pending {}: {}",
                self.config.name, call.method, reason
            );
            let _ = call
                .reply
                .send(Err(Error::Transport("connection lost".to_string())));
        }
    }

    /// Open a link, run the handshake and install it as the active link
    async fn establish(self: &Arc<Self>) -> Result<()> {
        let token = self.tokens.access_token().await.map_err(|e| {
            if e.is_fatal() {
                e
            } else {
                Error::ConnectFailed(format!("Token provider failed: {}", e))
            }
        })?;

        let TransportLink {
            outbound,
            mut inbound,
        } = self.connector.open(&self.config, token.as_deref()).await?;

        outbound
            .send(HandshakeRequest::default().to_record()?)
            .map_err(|_| Error::ConnectFailed("Link closed before handshake".to_string()))?;

        let frame = tokio::time::timeout(self.config.handshake_timeout(), inbound.recv())
            .await
            .map_err(|_| Error::Timeout("No handshake response".to_string()))?
            .ok_or_else(|| Error::ConnectFailed("Link closed during handshake".to_string()))?;

        let (response, early) = parse_handshake(&frame)?;
        if let Some(message) = response.error {
            let lowered = message.to_ascii_lowercase();
            return Err(if lowered.contains("unauthorized") || lowered.contains("forbidden") {
                Error::Unauthorized(message)
            } else {
                Error::ConnectFailed(format!("Handshake rejected: {}", message))
            });
        }

        if self.intentional.load(Ordering::SeqCst) {
            return Err(Error::ConnectFailed(
                "Disconnected while connecting".to_string(),
            ));
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let reader = tokio::spawn(read_loop(
            Arc::downgrade(self),
            generation,
            inbound,
            early,
            self.config.server_timeout(),
        ));
        let keepalive = tokio::spawn(keepalive_loop(
            outbound.clone(),
            self.config.keepalive_interval(),
        ));

        let previous = self.link.lock().replace(ActiveLink {
            generation,
            outbound,
            tasks: vec![reader, keepalive],
        });
        if let Some(previous) = previous {
            previous.shutdown();
        }

        self.budget.lock().reset();
        self.set_state(ConnectionState::Connected);
        Ok(())
    }

    async fn run_restore_hooks(&self) {
        let hooks: Vec<RestoreHook> = self.restore_hooks.lock().clone();
        for hook in hooks {
            hook().await;
        }
    }

    fn dispatch(&self, message: HubMessage) -> Option<LinkClosed> {
        match message {
            HubMessage::Completion {
                invocation_id,
                result,
                error,
            } => {
                let call = self.pending.lock().remove(&invocation_id);
                match call {
                    Some(call) => {
                        let outcome = match error {
                            Some(message) => Err(Error::Rpc {
                                method: call.method,
                                message,
                            }),
                            None => Ok(result),
                        };
                        let _ = call.reply.send(outcome);
                    }
                    None => debug!(
                        "{} channel: completion for unknown invocation {}",
                        self.config.name, invocation_id
                    ),
                }
            }
            HubMessage::Invocation {
                invocation_id: None,
                target,
                arguments,
            } => {
                let handler = self.push_handler.read().clone();
                match handler {
                    Some(handler) => handler(&target, arguments),
                    None => debug!("{} channel: no handler for {}", self.config.name, target),
                }
            }
            HubMessage::Invocation {
                invocation_id: Some(id),
                target,
                ..
            } => {
                warn!(
                    "{} channel: ignoring server-to-client call {} ({})",
                    self.config.name, target, id
                );
            }
            HubMessage::Ping => trace!("{} channel: ping", self.config.name),
            HubMessage::Close {
                error,
                allow_reconnect,
            } => {
                return Some(LinkClosed::Server {
                    error,
                    allow_reconnect,
                })
            }
            HubMessage::Unsupported(kind) => {
                debug!(
                    "{} channel: ignoring message type {}",
                    self.config.name, kind
                );
            }
        }
        None
    }

    /// Closed handler for the link identified by `generation`
    fn handle_link_closed(self: &Arc<Self>, generation: u64, reason: LinkClosed) {
        {
            let mut link = self.link.lock();
            match link.as_ref() {
                Some(active) if active.generation == generation => {}
                _ => return,
            }
            if let Some(active) = link.take() {
                // The reader task is the caller; only the keepalive needs stopping.
                for task in active.tasks.into_iter().skip(1) {
                    task.abort();
                }
            }
        }

        self.fail_pending("link closed");

        if self.intentional.load(Ordering::SeqCst) {
            debug!("{} channel closed after disconnect()", self.config.name);
            return;
        }

        match reason {
            LinkClosed::Server {
                error,
                allow_reconnect: false,
            } => {
                warn!(
                    "{} channel closed by server without reconnect: {:?}",
                    self.config.name, error
                );
                self.set_state(ConnectionState::Disconnected);
                self.emit(LifecycleEvent::ServerClosed { reason: error });
            }
            other => {
                warn!("{} channel lost ({:?})", self.config.name, other);
                Self::begin_reconnect(self);
            }
        }
    }

    /// Move to Reconnecting and start the retry loop, or settle in
    /// Disconnected when no attempt is left
    fn begin_reconnect(self: &Arc<Self>) {
        let exhausted = self.budget.lock().is_exhausted();
        if exhausted || self.intentional.load(Ordering::SeqCst) {
            self.set_state(ConnectionState::Disconnected);
        } else {
            self.set_state(ConnectionState::Reconnecting);
        }
        Self::schedule_reconnect(self);
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.intentional.load(Ordering::SeqCst) {
            return;
        }
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            debug!("{} channel: reconnect already in progress", self.config.name);
            return;
        }

        let inner = Arc::clone(self);
        let task = tokio::spawn(async move { inner.reconnect_loop().await });
        *self.reconnect_task.lock() = Some(task);
    }

    async fn reconnect_loop(self: Arc<Self>) {
        loop {
            if self.intentional.load(Ordering::SeqCst) {
                break;
            }

            let backoff = self.budget.lock().next();
            let delay = match backoff {
                Backoff::Retry(delay) => delay,
                Backoff::Stop => {
                    let attempts = self.budget.lock().attempt();
                    error!(
                        "{} channel: max reconnection attempts ({}) reached, giving up",
                        self.config.name, attempts
                    );
                    self.set_state(ConnectionState::Disconnected);
                    self.emit(LifecycleEvent::ReconnectExhausted { attempts });
                    break;
                }
            };

            let attempt = self.budget.lock().attempt();
            info!(
                "{} channel: reconnecting in {:?} (attempt {}/{})",
                self.config.name,
                delay,
                attempt,
                self.config.reconnect.max_attempts
            );
            self.set_state(ConnectionState::Reconnecting);
            self.emit(LifecycleEvent::Reconnecting { attempt, delay });

            tokio::time::sleep(delay).await;

            if self.intentional.load(Ordering::SeqCst) {
                break;
            }

            match self.establish().await {
                Ok(()) => {
                    info!(
                        "{} channel restored after {} attempt(s)",
                        self.config.name, attempt
                    );
                    self.reconnecting.store(false, Ordering::SeqCst);
                    self.emit(LifecycleEvent::Restored);
                    self.run_restore_hooks().await;
                    return;
                }
                Err(e) if e.is_fatal() => {
                    error!("{} channel reconnect rejected: {}", self.config.name, e);
                    self.set_state(ConnectionState::Disconnected);
                    self.emit(LifecycleEvent::AuthenticationRejected {
                        message: e.to_string(),
                    });
                    break;
                }
                Err(e) if !e.is_retryable() => {
                    error!(
                        "{} channel: reconnect attempt {} failed permanently: {}",
                        self.config.name, attempt, e
                    );
                    self.set_state(ConnectionState::Disconnected);
                    break;
                }
                Err(e) => {
                    warn!(
                        "{} channel: reconnect attempt {} failed: {}",
                        self.config.name, attempt, e
                    );
                }
            }
        }

        self.reconnecting.store(false, Ordering::SeqCst);
    }
}

async fn read_loop(
    inner: Weak<Inner>,
    generation: u64,
    mut inbound: mpsc::UnboundedReceiver<String>,
    early: Vec<HubMessage>,
    server_timeout: Duration,
) {
    let mut closed = None;

    if let Some(strong) = inner.upgrade() {
        for message in early {
            if let Some(reason) = strong.dispatch(message) {
                closed = Some(reason);
                break;
            }
        }
    }

    let reason = match closed {
        Some(reason) => reason,
        None => 'read: loop {
            let frame = match tokio::time::timeout(server_timeout, inbound.recv()).await {
                Ok(Some(frame)) => frame,
                Ok(None) => break LinkClosed::Transport,
                Err(_) => break LinkClosed::ServerTimeout,
            };

            let Some(strong) = inner.upgrade() else {
                return;
            };

            for message in decode_frame(&frame) {
                if let Some(reason) = strong.dispatch(message) {
                    break 'read reason;
                }
            }
        },
    };

    if let Some(strong) = inner.upgrade() {
        strong.handle_link_closed(generation, reason);
    }
}

async fn keepalive_loop(outbound: mpsc::UnboundedSender<String>, interval: Duration) {
    let ping = match HubMessage::Ping.to_record() {
        Ok(record) => record,
        Err(e) => {
            error!("Failed to encode ping: {}", e);
            return;
        }
    };

    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if outbound.send(ping.clone()).is_err() {
            break;
        }
    }
}
