//! Wire formats for the four transports.
//!
//! Every payload is JSON. Framing differs per transport:
//! ```text
//! TCP        {"user_id":..,"manga_id":..,"chapter":..}\n   (one ProgressEvent per line)
//! UDP        REGISTER | UNREGISTER | BROADCAST <json> | <NotificationEvent json>
//! WebSocket  text frame: ClientFrame (client → hub), ChatMessage (hub → client)
//! RPC        {"method":..,"params":[AuditRequest],"id":n}\n
//! ```
//!
//! Payloads are encoded once per event and shared between recipients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::Identity;
use crate::error::SyncError;

/// UDP registration request.
pub const REGISTER: &str = "REGISTER";
/// UDP registration confirmation, sent by the hub before any notification.
pub const REGISTERED: &str = "REGISTERED";
/// UDP best-effort deregistration.
pub const UNREGISTER: &str = "UNREGISTER";
/// UDP administrative broadcast prefix.
pub const BROADCAST_PREFIX: &str = "BROADCAST ";

/// A reading-progress change, fanned out by the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub user_id: String,
    pub manga_id: String,
    pub chapter: i64,
    #[serde(default)]
    pub status: String,
    /// Unix seconds. Zero when the sender did not stamp the event.
    #[serde(default)]
    pub timestamp: i64,
}

impl ProgressEvent {
    pub fn new(
        user_id: impl Into<String>,
        manga_id: impl Into<String>,
        chapter: i64,
        status: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            manga_id: manga_id.into(),
            chapter,
            status: status.into(),
            timestamp: Utc::now().timestamp(),
        }
    }

    /// Serialize without the trailing newline.
    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(line: &str) -> Result<Self, SyncError> {
        Ok(serde_json::from_str(line.trim())?)
    }
}

/// A best-effort notification delivered over UDP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub manga_id: String,
    pub message: String,
    #[serde(default)]
    pub timestamp: i64,
}

impl NotificationEvent {
    pub fn new(kind: impl Into<String>, manga_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            manga_id: manga_id.into(),
            message: message.into(),
            timestamp: Utc::now().timestamp(),
        }
    }

    /// Notification announcing a progress change.
    pub fn progress(event: &ProgressEvent) -> Self {
        Self {
            kind: "progress_update".to_string(),
            manga_id: event.manga_id.clone(),
            message: format!(
                "User {} reached chapter {} of {}",
                event.user_id, event.chapter, event.manga_id
            ),
            timestamp: event.timestamp,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SyncError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Chat message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    #[default]
    Text,
    Join,
    Leave,
    System,
}

/// A message delivered to every member of a chat room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub room_id: String,
    pub user_id: String,
    pub username: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: ChatKind,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    fn build(room_id: &str, user_id: &str, username: &str, content: String, kind: ChatKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            username: username.to_string(),
            content,
            kind,
            timestamp: Utc::now(),
        }
    }

    pub fn text(room_id: &str, author: &Identity, content: impl Into<String>) -> Self {
        Self::build(room_id, &author.user_id, &author.username, content.into(), ChatKind::Text)
    }

    pub fn join(room_id: &str, member: &Identity) -> Self {
        let content = format!("{} joined the room", member.username);
        Self::build(room_id, &member.user_id, &member.username, content, ChatKind::Join)
    }

    pub fn leave(room_id: &str, member: &Identity) -> Self {
        let content = format!("{} left the room", member.username);
        Self::build(room_id, &member.user_id, &member.username, content, ChatKind::Leave)
    }

    pub fn system(room_id: &str, content: impl Into<String>) -> Self {
        Self::build(room_id, "system", "system", content.into(), ChatKind::System)
    }

    pub fn encode(&self) -> Result<String, SyncError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, SyncError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Frame sent by a chat client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    #[serde(default)]
    pub room_id: String,
    pub content: String,
    #[serde(rename = "type", default)]
    pub kind: ChatKind,
}

impl ClientFrame {
    pub fn text(room_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            content: content.into(),
            kind: ChatKind::Text,
        }
    }
}

/// Audit record sent to the RPC peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRequest {
    pub user_id: String,
    pub manga_id: String,
    pub current_chapter: i64,
    pub status: String,
}

impl From<&ProgressEvent> for AuditRequest {
    fn from(event: &ProgressEvent) -> Self {
        Self {
            user_id: event.user_id.clone(),
            manga_id: event.manga_id.clone(),
            current_chapter: event.chapter,
            status: event.status.clone(),
        }
    }
}

/// JSON-RPC request envelope, one per line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    pub params: [AuditRequest; 1],
    pub id: u64,
}

impl RpcRequest {
    pub fn audit(method: &str, id: u64, request: AuditRequest) -> Self {
        Self {
            method: method.to_string(),
            params: [request],
            id,
        }
    }

    /// Serialize with the terminating newline.
    pub fn encode_line(&self) -> Result<Vec<u8>, SyncError> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}

/// A datagram received by the UDP hub.
#[derive(Debug, Clone, PartialEq)]
pub enum UdpCommand {
    Register,
    Unregister,
    Broadcast(NotificationEvent),
    Unknown,
}

impl UdpCommand {
    /// Parse a datagram. Only a malformed `BROADCAST` body is an error;
    /// anything else unrecognised is `Unknown`.
    pub fn parse(datagram: &[u8]) -> Result<Self, SyncError> {
        let Ok(text) = std::str::from_utf8(datagram) else {
            return Ok(Self::Unknown);
        };
        let text = text.trim();
        if text == REGISTER {
            return Ok(Self::Register);
        }
        if text == UNREGISTER {
            return Ok(Self::Unregister);
        }
        if let Some(body) = text.strip_prefix(BROADCAST_PREFIX) {
            let event = NotificationEvent::decode(body.trim().as_bytes())?;
            return Ok(Self::Broadcast(event));
        }
        Ok(Self::Unknown)
    }
}

/// Control datagrams a UDP listener may send after registering.
#[derive(Debug, Clone, PartialEq)]
pub enum UdpControl {
    Unregister,
    Broadcast(NotificationEvent),
}

impl UdpControl {
    pub fn to_datagram(&self) -> Result<Vec<u8>, SyncError> {
        match self {
            Self::Unregister => Ok(UNREGISTER.as_bytes().to_vec()),
            Self::Broadcast(event) => {
                let mut datagram = BROADCAST_PREFIX.as_bytes().to_vec();
                datagram.extend(event.encode()?);
                Ok(datagram)
            }
        }
    }
}
