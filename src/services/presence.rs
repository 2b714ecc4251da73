//! Presence tracking: which users hold live connections to which rooms.
//!
//! Process-local and best-effort. Empty at boot and never written to the Room Store.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::models::PresenceMember;

#[derive(Default)]
struct PresenceState {
    /// room -> one entry per connection, in join order.
    rooms: HashMap<Uuid, Vec<PresenceMember>>,
    /// connection -> rooms it is present in.
    connections: HashMap<String, HashSet<Uuid>>,
}

impl PresenceState {
    /// Drop `connection_id` from `room_id`. Returns the removed entry and whether
    /// that user still has another connection in the room.
    fn remove(&mut self, room_id: Uuid, connection_id: &str) -> Option<(PresenceMember, bool)> {
        let bucket = self.rooms.get_mut(&room_id)?;
        let idx = bucket.iter().position(|m| m.connection_id == connection_id)?;
        let member = bucket.remove(idx);
        let still_present = bucket.iter().any(|m| m.user_id == member.user_id);
        if bucket.is_empty() {
            self.rooms.remove(&room_id);
        }
        if let Some(rooms) = self.connections.get_mut(connection_id) {
            rooms.remove(&room_id);
            if rooms.is_empty() {
                self.connections.remove(connection_id);
            }
        }
        Some((member, still_present))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinOutcome {
    /// Presence set of the room after the join.
    pub members: Vec<PresenceMember>,
    /// True when no other connection of this user was already present.
    pub first_connection: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LeaveOutcome {
    /// The user has no connection left in the room.
    pub user_departed: bool,
    pub room_empty: bool,
}

/// A room a dropped connection was present in.
#[derive(Debug, Clone, PartialEq)]
pub struct Departure {
    pub room_id: Uuid,
    pub member: PresenceMember,
    pub user_departed: bool,
    pub room_empty: bool,
}

#[derive(Clone, Default)]
pub struct PresenceService {
    state: Arc<RwLock<PresenceState>>,
}

impl PresenceService {
    pub fn new() -> Self {
        Self::default()
    }

    #[instrument(skip(self))]
    pub async fn track_join(
        &self,
        room_id: Uuid,
        user_id: &str,
        username: &str,
        connection_id: &str,
    ) -> JoinOutcome {
        let mut state = self.state.write().await;
        let bucket = state.rooms.entry(room_id).or_default();
        let first_connection = !bucket.iter().any(|m| m.user_id == user_id);
        if !bucket.iter().any(|m| m.connection_id == connection_id) {
            bucket.push(PresenceMember::new(user_id, username, connection_id));
        }
        let members = bucket.clone();
        state
            .connections
            .entry(connection_id.to_string())
            .or_default()
            .insert(room_id);
        debug!(members = members.len(), first_connection, "presence join");
        JoinOutcome {
            members,
            first_connection,
        }
    }

    #[instrument(skip(self))]
    pub async fn track_leave(&self, room_id: Uuid, user_id: &str, connection_id: &str) -> LeaveOutcome {
        let mut state = self.state.write().await;
        let departed = match state.remove(room_id, connection_id) {
            Some((member, still_present)) if member.user_id == user_id => !still_present,
            Some((member, _)) => {
                debug!(owner = %member.user_id, "connection belonged to another user");
                false
            }
            None => false,
        };
        LeaveOutcome {
            user_departed: departed,
            room_empty: !state.rooms.contains_key(&room_id),
        }
    }

    /// Leave every room the connection was present in.
    #[instrument(skip(self))]
    pub async fn track_disconnect(&self, connection_id: &str) -> Vec<Departure> {
        let mut state = self.state.write().await;
        let rooms: Vec<Uuid> = state
            .connections
            .get(connection_id)
            .map(|r| r.iter().copied().collect())
            .unwrap_or_default();
        let mut departures = Vec::with_capacity(rooms.len());
        for room_id in rooms {
            if let Some((member, still_present)) = state.remove(room_id, connection_id) {
                departures.push(Departure {
                    room_id,
                    member,
                    user_departed: !still_present,
                    room_empty: !state.rooms.contains_key(&room_id),
                });
            }
        }
        state.connections.remove(connection_id);
        departures
    }

    pub async fn members(&self, room_id: Uuid) -> Vec<PresenceMember> {
        self.state
            .read()
            .await
            .rooms
            .get(&room_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn room_is_empty(&self, room_id: Uuid) -> bool {
        !self.state.read().await.rooms.contains_key(&room_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_connection_of_same_user_is_not_a_new_arrival() {
        let presence = PresenceService::new();
        let room = Uuid::new_v4();
        let first = presence.track_join(room, "alice", "Alice", "c1").await;
        assert!(first.first_connection);
        let second = presence.track_join(room, "alice", "Alice", "c2").await;
        assert!(!second.first_connection);
        assert_eq!(second.members.len(), 2);

        let leave = presence.track_leave(room, "alice", "c1").await;
        assert!(!leave.user_departed);
        let leave = presence.track_leave(room, "alice", "c2").await;
        assert!(leave.user_departed);
        assert!(leave.room_empty);
    }

    #[tokio::test]
    async fn rejoin_on_same_connection_does_not_duplicate() {
        let presence = PresenceService::new();
        let room = Uuid::new_v4();
        presence.track_join(room, "alice", "Alice", "c1").await;
        let again = presence.track_join(room, "alice", "Alice", "c1").await;
        assert_eq!(again.members.len(), 1);
    }

    #[tokio::test]
    async fn disconnect_leaves_every_room_and_collects_empty_buckets() {
        let presence = PresenceService::new();
        let (r1, r2) = (Uuid::new_v4(), Uuid::new_v4());
        presence.track_join(r1, "bob", "Bob", "c-bob").await;
        presence.track_join(r2, "bob", "Bob", "c-bob").await;
        presence.track_join(r2, "alice", "Alice", "c-alice").await;

        let mut departures = presence.track_disconnect("c-bob").await;
        departures.sort_by_key(|d| d.room_empty);
        assert_eq!(departures.len(), 2);
        assert!(departures.iter().all(|d| d.user_departed && d.member.user_id == "bob"));
        assert!(presence.room_is_empty(r1).await);
        assert!(!presence.room_is_empty(r2).await);
        assert_eq!(presence.members(r2).await.len(), 1);
        assert!(presence.track_disconnect("c-bob").await.is_empty());
    }

    #[tokio::test]
    async fn leave_of_unknown_connection_is_noop() {
        let presence = PresenceService::new();
        let room = Uuid::new_v4();
        let outcome = presence.track_leave(room, "ghost", "nope").await;
        assert!(!outcome.user_departed);
        assert!(outcome.room_empty);
    }
}
