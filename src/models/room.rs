//! Room aggregate: membership, shared cart and chat history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::cart::{CartLine, CartView};
use super::chat::ChatMessage;
use crate::error::{AppError, AppResult};

/// Length of a shareable room code.
pub const ROOM_CODE_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: String,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Room {
    pub id: Uuid,
    /// Uppercase join token, unique among active rooms.
    pub code: String,
    pub name: String,
    pub creator_id: String,
    pub is_active: bool,
    /// Ordered by `joined_at`, one entry per user.
    pub participants: Vec<Participant>,
    pub shared_cart: Vec<CartLine>,
    pub chat_history: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Room {
    /// New active room whose only participant is its creator.
    pub fn new(name: &str, creator_id: &str, code: String, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            code,
            name: name.to_string(),
            creator_id: creator_id.to_string(),
            is_active: true,
            participants: vec![Participant {
                user_id: creator_id.to_string(),
                joined_at: now,
            }],
            shared_cart: Vec::new(),
            chat_history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_participant(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p.user_id == user_id)
    }

    /// Add a participant unless already present. Returns whether the user was added.
    pub fn add_participant(&mut self, user_id: &str, now: DateTime<Utc>) -> bool {
        if self.is_participant(user_id) {
            return false;
        }
        self.participants.push(Participant {
            user_id: user_id.to_string(),
            joined_at: now,
        });
        self.updated_at = now;
        true
    }

    pub fn ensure_participant(&self, user_id: &str) -> AppResult<()> {
        if !self.is_participant(user_id) {
            return Err(AppError::Forbidden(format!(
                "user '{}' is not a participant of room {}",
                user_id, self.id
            )));
        }
        Ok(())
    }

    pub fn ensure_creator(&self, user_id: &str) -> AppResult<()> {
        if self.creator_id != user_id {
            return Err(AppError::Forbidden(
                "only the room creator can delete the room".to_string(),
            ));
        }
        Ok(())
    }

    pub fn code_matches(&self, code: &str) -> bool {
        self.code == normalize_code(code)
    }
}

/// Fresh random room code: uppercase hex, fixed length.
pub fn generate_room_code() -> String {
    let raw = Uuid::new_v4().simple().to_string();
    raw[..ROOM_CODE_LEN].to_uppercase()
}

/// Canonical form used for storage and lookup.
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// Client-facing shape of a room, with the cart projected for display.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomView {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub creator_id: String,
    pub is_active: bool,
    pub participants: Vec<Participant>,
    pub shared_cart: CartView,
    pub chat_history: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Room> for RoomView {
    fn from(room: &Room) -> Self {
        Self {
            id: room.id,
            code: room.code.clone(),
            name: room.name.clone(),
            creator_id: room.creator_id.clone(),
            is_active: room.is_active,
            participants: room.participants.clone(),
            shared_cart: CartView::project(&room.shared_cart),
            chat_history: room.chat_history.clone(),
            created_at: room.created_at,
            updated_at: room.updated_at,
        }
    }
}
