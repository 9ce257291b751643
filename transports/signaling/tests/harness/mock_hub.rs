//! In-memory hub speaking the JSON hub protocol

use super::{HarnessError, HarnessResult};
use async_trait::async_trait;
use callhub_signaling::protocol::{decode_frame, HubMessage, RECORD_SEPARATOR};
use callhub_signaling::{ChannelConfig, Connector, Error, Result, TransportLink};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;

/// One client invocation seen by the hub
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub target: String,
    pub arguments: Vec<Value>,
}

type Responder = Arc<dyn Fn(&[Value]) -> std::result::Result<Value, String> + Send + Sync>;

/// Sender side of the current link, shared with its server task
type LinkSlot = Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>;

#[derive(Default)]
struct HubState {
    invocations: Vec<Invocation>,
    responders: HashMap<String, Responder>,
    /// Targets recorded but never completed
    held: HashSet<String>,
    mute_pings: bool,
    refusals: VecDeque<Error>,
    tokens_seen: Vec<Option<String>>,
    connect_attempts: u32,
    pings: u32,
    link: Option<LinkSlot>,
}

/// Scriptable hub shared between a test and the clients under test
#[derive(Clone, Default)]
pub struct MockHub {
    state: Arc<Mutex<HubState>>,
}

impl MockHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    // ========================================================================
    // Scripting
    // ========================================================================

    /// Answer `target` with the value computed from its arguments
    pub fn respond<F>(&self, target: &str, responder: F)
    where
        F: Fn(&[Value]) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        self.state
            .lock()
            .responders
            .insert(target.to_string(), Arc::new(responder));
    }

    /// Answer `target` with a fixed value
    pub fn respond_value(&self, target: &str, value: Value) {
        self.respond(target, move |_| Ok(value.clone()));
    }

    /// Complete `target` with an error
    pub fn fail(&self, target: &str, message: &str) {
        let message = message.to_string();
        self.respond(target, move |_| Err(message.clone()));
    }

    /// Record calls to `target` without ever completing them
    pub fn hold(&self, target: &str) {
        self.state.lock().held.insert(target.to_string());
    }

    /// Complete calls to `target` again; calls already held stay unanswered
    pub fn release(&self, target: &str) {
        self.state.lock().held.remove(target);
    }

    /// Stop answering client pings, so the client's server timeout fires
    pub fn mute_pings(&self) {
        self.state.lock().mute_pings = true;
    }

    /// Refuse the next `count` connect attempts with a transport failure
    pub fn refuse_connects(&self, count: usize) {
        let mut state = self.state.lock();
        for _ in 0..count {
            state
                .refusals
                .push_back(Error::ConnectFailed("connection refused".to_string()));
        }
    }

    /// Reject the next connect attempt as unauthorized
    pub fn reject_next_token(&self) {
        self.state
            .lock()
            .refusals
            .push_back(Error::Unauthorized("HTTP 401".to_string()));
    }

    // ========================================================================
    // Observation
    // ========================================================================

    pub fn connect_attempts(&self) -> u32 {
        self.state.lock().connect_attempts
    }

    pub fn tokens_seen(&self) -> Vec<Option<String>> {
        self.state.lock().tokens_seen.clone()
    }

    pub fn pings(&self) -> u32 {
        self.state.lock().pings
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.state.lock().invocations.clone()
    }

    /// Arguments of every call to `target`, in arrival order
    pub fn calls_to(&self, target: &str) -> Vec<Vec<Value>> {
        self.state
            .lock()
            .invocations
            .iter()
            .filter(|inv| inv.target == target)
            .map(|inv| inv.arguments.clone())
            .collect()
    }

    pub fn count(&self, target: &str) -> usize {
        self.calls_to(target).len()
    }

    pub fn clear_invocations(&self) {
        self.state.lock().invocations.clear();
    }

    pub fn has_link(&self) -> bool {
        self.state
            .lock()
            .link
            .as_ref()
            .is_some_and(|slot| slot.lock().is_some())
    }

    // ========================================================================
    // Server-side actions
    // ========================================================================

    /// Deliver a push event on the current link
    pub fn push(&self, target: &str, arguments: Vec<Value>) -> HarnessResult<()> {
        let record = HubMessage::push(target, arguments)
            .to_record()
            .map_err(|e| HarnessError::LinkClosed(e.to_string()))?;
        self.send_raw(record)
    }

    /// Deliver a raw frame on the current link
    pub fn send_raw(&self, frame: String) -> HarnessResult<()> {
        let slot = self.state.lock().link.clone().ok_or(HarnessError::NoLink)?;
        let sender = slot.lock().clone().ok_or(HarnessError::NoLink)?;
        sender
            .send(frame)
            .map_err(|_| HarnessError::LinkClosed("client gone".to_string()))
    }

    /// Drop the current link as a network failure would
    pub fn drop_link(&self) {
        let slot = self.state.lock().link.take();
        if let Some(slot) = slot {
            slot.lock().take();
        }
    }

    /// Send a Close record, then drop the link
    pub fn close(&self, error: Option<&str>, allow_reconnect: bool) -> HarnessResult<()> {
        let record = HubMessage::Close {
            error: error.map(str::to_string),
            allow_reconnect,
        }
        .to_record()
        .map_err(|e| HarnessError::LinkClosed(e.to_string()))?;
        self.send_raw(record)?;
        self.drop_link();
        Ok(())
    }

    fn complete(&self, target: &str, arguments: &[Value]) -> (Option<Value>, Option<String>) {
        let responder = self.state.lock().responders.get(target).cloned();
        match responder {
            Some(responder) => match responder(arguments) {
                Ok(Value::Null) => (None, None),
                Ok(value) => (Some(value), None),
                Err(message) => (None, Some(message)),
            },
            None => (None, None),
        }
    }

    async fn serve(self, slot: LinkSlot, mut from_client: mpsc::UnboundedReceiver<String>) {
        let mut handshaken = false;

        while let Some(frame) = from_client.recv().await {
            if !handshaken {
                handshaken = true;
                let reply = format!("{{}}{}", RECORD_SEPARATOR);
                if !Self::send_on(&slot, reply) {
                    return;
                }
                continue;
            }

            for message in decode_frame(&frame) {
                match message {
                    HubMessage::Invocation {
                        invocation_id,
                        target,
                        arguments,
                    } => {
                        self.state.lock().invocations.push(Invocation {
                            target: target.clone(),
                            arguments: arguments.clone(),
                        });

                        let Some(invocation_id) = invocation_id else {
                            continue;
                        };
                        if self.state.lock().held.contains(&target) {
                            continue;
                        }
                        let (result, error) = self.complete(&target, &arguments);
                        let completion = HubMessage::Completion {
                            invocation_id,
                            result,
                            error,
                        };
                        if let Ok(record) = completion.to_record() {
                            if !Self::send_on(&slot, record) {
                                return;
                            }
                        }
                    }
                    HubMessage::Ping => {
                        let muted = {
                            let mut state = self.state.lock();
                            state.pings += 1;
                            state.mute_pings
                        };
                        if muted {
                            continue;
                        }
                        if let Ok(record) = HubMessage::Ping.to_record() {
                            if !Self::send_on(&slot, record) {
                                return;
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    fn send_on(slot: &LinkSlot, frame: String) -> bool {
        match slot.lock().as_ref() {
            Some(sender) => sender.send(frame).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl Connector for MockHub {
    async fn open(&self, _config: &ChannelConfig, access_token: Option<&str>) -> Result<TransportLink> {
        let refusal = {
            let mut state = self.state.lock();
            state.connect_attempts += 1;
            state.tokens_seen.push(access_token.map(str::to_string));
            state.refusals.pop_front()
        };
        if let Some(error) = refusal {
            return Err(error);
        }

        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();

        let slot: LinkSlot = Arc::new(Mutex::new(Some(to_client)));
        let previous = self.state.lock().link.replace(Arc::clone(&slot));
        if let Some(previous) = previous {
            previous.lock().take();
        }

        tokio::spawn(self.clone().serve(slot, from_client));

        Ok(TransportLink { outbound, inbound })
    }
}
