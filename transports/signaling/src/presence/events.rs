//! Push events delivered on the presence channel

use crate::listeners::Event;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Presence status published by a user
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Busy,
    Offline,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdate {
    pub user_id: String,
    pub status: PresenceStatus,
    #[serde(default)]
    pub last_seen: Option<String>,
    #[serde(default)]
    pub is_online: bool,
}

/// Contact directory notification, passed through uninterpreted
#[derive(Debug, Clone, PartialEq)]
pub struct ContactNotice {
    pub payload: Value,
}

impl ContactNotice {
    /// Id of the contact the notice is about, if the payload names one
    pub fn contact_id(&self) -> Option<&str> {
        match &self.payload {
            Value::String(id) => Some(id),
            Value::Object(map) => ["contactId", "userId", "id"]
                .iter()
                .find_map(|key| map.get(*key).and_then(Value::as_str)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    PresenceUpdate(PresenceUpdate),
    ContactAdded(ContactNotice),
    ContactRemoved(ContactNotice),
    ContactUpdated(ContactNotice),
    ContactBlocked(ContactNotice),
    ContactUnblocked(ContactNotice),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresenceEventKind {
    PresenceUpdate,
    ContactAdded,
    ContactRemoved,
    ContactUpdated,
    ContactBlocked,
    ContactUnblocked,
}

impl PresenceEventKind {
    pub fn wire_name(self) -> &'static str {
        match self {
            PresenceEventKind::PresenceUpdate => "PresenceUpdate",
            PresenceEventKind::ContactAdded => "ContactAdded",
            PresenceEventKind::ContactRemoved => "ContactRemoved",
            PresenceEventKind::ContactUpdated => "ContactUpdated",
            PresenceEventKind::ContactBlocked => "ContactBlocked",
            PresenceEventKind::ContactUnblocked => "ContactUnblocked",
        }
    }
}

impl Event for PresenceEvent {
    type Kind = PresenceEventKind;

    fn kind(&self) -> PresenceEventKind {
        match self {
            PresenceEvent::PresenceUpdate(_) => PresenceEventKind::PresenceUpdate,
            PresenceEvent::ContactAdded(_) => PresenceEventKind::ContactAdded,
            PresenceEvent::ContactRemoved(_) => PresenceEventKind::ContactRemoved,
            PresenceEvent::ContactUpdated(_) => PresenceEventKind::ContactUpdated,
            PresenceEvent::ContactBlocked(_) => PresenceEventKind::ContactBlocked,
            PresenceEvent::ContactUnblocked(_) => PresenceEventKind::ContactUnblocked,
        }
    }
}

impl PresenceEvent {
    /// Decode a push invocation; `Ok(None)` for unknown targets
    pub fn from_push(target: &str, arguments: Vec<Value>) -> Result<Option<Self>> {
        let payload = arguments.into_iter().next();

        let notice = |payload: Option<Value>| -> Result<ContactNotice> {
            payload
                .map(|payload| ContactNotice { payload })
                .ok_or_else(|| Error::Protocol(format!("{} push event without payload", target)))
        };

        let event = match target {
            "PresenceUpdate" => {
                let value = payload.ok_or_else(|| {
                    Error::Protocol("PresenceUpdate push event without payload".to_string())
                })?;
                let update = serde_json::from_value(value).map_err(|e| {
                    Error::SerializationError(format!("Invalid PresenceUpdate payload: {}", e))
                })?;
                PresenceEvent::PresenceUpdate(update)
            }
            "ContactAdded" => PresenceEvent::ContactAdded(notice(payload)?),
            "ContactRemoved" => PresenceEvent::ContactRemoved(notice(payload)?),
            "ContactUpdated" => PresenceEvent::ContactUpdated(notice(payload)?),
            "ContactBlocked" => PresenceEvent::ContactBlocked(notice(payload)?),
            "ContactUnblocked" => PresenceEvent::ContactUnblocked(notice(payload)?),
            _ => return Ok(None),
        };

        Ok(Some(event))
    }
}
