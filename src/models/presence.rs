//! Presence: who currently holds a live connection to a room.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One live connection of a user in a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMember {
    pub user_id: String,
    pub username: String,
    pub connection_id: String,
}

impl PresenceMember {
    pub fn new(
        user_id: impl Into<String>,
        username: impl Into<String>,
        connection_id: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
            connection_id: connection_id.into(),
        }
    }
}

/// Generate a unique socket/connection id.
pub fn generate_socket_id() -> String {
    format!("{}.{}", std::process::id(), Uuid::new_v4().as_simple())
}
