//! Chat messages stored in a room's append-only history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::Identity;
use crate::error::{AppError, AppResult};

/// Maximum message body length, in characters.
pub const MAX_MESSAGE_LEN: usize = 2000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub author_id: String,
    pub username: String,
    pub body: String,
    /// Assigned by the server when the message is accepted.
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(author: &Identity, body: &str, timestamp: DateTime<Utc>) -> AppResult<Self> {
        if body.trim().is_empty() {
            return Err(AppError::Validation("message cannot be empty".to_string()));
        }
        let len = body.chars().count();
        if len > MAX_MESSAGE_LEN {
            return Err(AppError::Validation(format!(
                "message cannot exceed {} characters (got {})",
                MAX_MESSAGE_LEN, len
            )));
        }
        Ok(Self {
            author_id: author.user_id.clone(),
            username: author.username.clone(),
            body: body.to_string(),
            timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_body_is_rejected() {
        let alice = Identity::new("alice", "Alice");
        assert!(ChatMessage::new(&alice, "   ", Utc::now()).is_err());
        assert!(ChatMessage::new(&alice, "", Utc::now()).is_err());
    }

    #[test]
    fn body_is_kept_verbatim() {
        let alice = Identity::new("alice", "Alice");
        let msg = ChatMessage::new(&alice, " hi there ", Utc::now()).unwrap();
        assert_eq!(msg.body, " hi there ");
        assert_eq!(msg.author_id, "alice");
        assert_eq!(msg.username, "Alice");
    }

    #[test]
    fn overlong_body_is_rejected() {
        let alice = Identity::new("alice", "Alice");
        let body = "a".repeat(MAX_MESSAGE_LEN + 1);
        assert!(matches!(
            ChatMessage::new(&alice, &body, Utc::now()),
            Err(AppError::Validation(_))
        ));
    }
}
