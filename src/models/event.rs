//! WebSocket wire contract: client messages and server events.
//!
//! Every frame is JSON `{"event": "<kebab-case name>", "data": {...}}`. Server
//! events that belong to a room also carry `"roomId"`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::cart::{CartAction, CartItemView, CartView, ProductSnapshot};
use super::presence::PresenceMember;
use crate::error::AppError;

// ---- client -> server ----

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    JoinRoom(JoinRoomPayload),
    LeaveRoom(LeaveRoomPayload),
    CartUpdate(CartUpdatePayload),
    ChatMessage(ChatPayload),
    Typing(TypingPayload),
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomPayload {
    pub room_id: Uuid,
    /// Room code, required when the user is not yet a participant.
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveRoomPayload {
    pub room_id: Uuid,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartUpdatePayload {
    pub room_id: Uuid,
    pub action: CartAction,
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub quantity: Option<i64>,
    #[serde(default)]
    pub product_data: Option<ProductSnapshot>,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    pub room_id: Uuid,
    pub message: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    /// Accepted for compatibility; the server assigns the stored timestamp.
    #[serde(default)]
    pub timestamp: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub room_id: Uuid,
    pub is_typing: bool,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

impl ClientMessage {
    pub fn room_id(&self) -> Option<Uuid> {
        match self {
            ClientMessage::JoinRoom(p) => Some(p.room_id),
            ClientMessage::LeaveRoom(p) => Some(p.room_id),
            ClientMessage::CartUpdate(p) => Some(p.room_id),
            ClientMessage::ChatMessage(p) => Some(p.room_id),
            ClientMessage::Typing(p) => Some(p.room_id),
            ClientMessage::Ping => None,
        }
    }

    /// The `userId` the client claims to act as, if it sent one.
    pub fn claimed_user_id(&self) -> Option<&str> {
        match self {
            ClientMessage::JoinRoom(p) => p.user_id.as_deref(),
            ClientMessage::LeaveRoom(p) => p.user_id.as_deref(),
            ClientMessage::CartUpdate(p) => p.user_id.as_deref(),
            ClientMessage::ChatMessage(p) => p.user_id.as_deref(),
            ClientMessage::Typing(p) => p.user_id.as_deref(),
            ClientMessage::Ping => None,
        }
    }
}

// ---- server -> client ----

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    ConnectionEstablished(ConnectionEstablished),
    RoomParticipants(Vec<PresenceMember>),
    UserJoined(UserJoined),
    UserLeft(UserLeft),
    CartUpdated(CartUpdated),
    NewMessage(NewMessage),
    UserTyping(UserTyping),
    CartUpdateError(ErrorPayload),
    Error(ErrorPayload),
    Pong,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEstablished {
    pub socket_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserJoined {
    pub user_id: String,
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLeft {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartUpdated {
    pub cart: Vec<CartItemView>,
    pub subtotal: f64,
    pub item_count: i64,
    pub updated_by: String,
    pub action: CartAction,
    pub product_id: String,
}

impl CartUpdated {
    pub fn new(view: CartView, updated_by: &str, action: CartAction, product_id: &str) -> Self {
        Self {
            cart: view.items,
            subtotal: view.subtotal,
            item_count: view.item_count,
            updated_by: updated_by.to_string(),
            action,
            product_id: product_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub message: String,
    pub user_id: String,
    pub username: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTyping {
    pub user_id: String,
    pub username: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
    pub code: String,
}

impl From<&AppError> for ErrorPayload {
    fn from(e: &AppError) -> Self {
        Self {
            error: e.to_string(),
            code: e.error_code().to_string(),
        }
    }
}

/// Event frame sent over WebSocket to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsEvent {
    #[serde(rename = "roomId", default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<Uuid>,
    #[serde(flatten)]
    pub event: ServerEvent,
}

impl WsEvent {
    pub fn for_room(room_id: Uuid, event: ServerEvent) -> Self {
        Self {
            room_id: Some(room_id),
            event,
        }
    }

    pub fn direct(event: ServerEvent) -> Self {
        Self {
            room_id: None,
            event,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
