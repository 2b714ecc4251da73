//! Room Store: durable room documents behind a backend-agnostic trait.
//!
//! [`MemoryRoomStore`] keeps rooms in process memory (no `DATABASE_URL`, tests);
//! [`crate::db::PgRoomStore`] persists them in PostgreSQL.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{normalize_code, CartLine, ChatMessage, Room};

/// Computes the next cart lines from the locked room. Returning an error aborts the write.
pub type CartMutation<'a> = &'a (dyn Fn(&Room) -> AppResult<Vec<CartLine>> + Send + Sync);

#[async_trait]
pub trait RoomStore: Send + Sync {
    /// Insert a new room. Returns `false` when its code is already held by an active room.
    async fn insert_room(&self, room: &Room) -> AppResult<bool>;

    /// Active room holding `code`, compared case-insensitively.
    async fn find_active_by_code(&self, code: &str) -> AppResult<Option<Room>>;

    /// Room by id, active or not.
    async fn get_room(&self, room_id: Uuid) -> AppResult<Option<Room>>;

    /// Add `user_id` to the room's participants if absent. Returns the room and
    /// whether the user was newly added.
    async fn add_participant(
        &self,
        room_id: Uuid,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<(Room, bool)>;

    /// Active rooms `user_id` participates in, most recently updated first.
    async fn rooms_for_user(&self, user_id: &str) -> AppResult<Vec<Room>>;

    /// Atomically replace an active room's cart with the lines `mutation` computes
    /// from the current, locked state. Returns the updated room.
    ///
    /// `budget` bounds the work up to the commit. A commit that has been issued is
    /// never abandoned, so an error always means the stored cart is unchanged.
    async fn mutate_cart(
        &self,
        room_id: Uuid,
        now: DateTime<Utc>,
        budget: Duration,
        mutation: CartMutation<'_>,
    ) -> AppResult<Room>;

    /// Append to an active room's chat history. `NotFound` once the room is deactivated.
    async fn append_message(&self, room_id: Uuid, message: &ChatMessage) -> AppResult<()>;

    /// Soft-delete: the room stays stored but is no longer active.
    async fn deactivate(&self, room_id: Uuid, now: DateTime<Utc>) -> AppResult<()>;
}

fn room_not_found(room_id: Uuid) -> AppError {
    AppError::NotFound(format!("room {}", room_id))
}

pub(crate) fn store_timeout(budget: Duration) -> AppError {
    AppError::Persistence(format!(
        "room store did not answer within {} ms",
        budget.as_millis()
    ))
}

/// Process-local store. One mutex per room document.
#[derive(Clone, Default)]
pub struct MemoryRoomStore {
    rooms: Arc<RwLock<HashMap<Uuid, Arc<Mutex<Room>>>>>,
    /// Uppercase code -> id, active rooms only.
    codes: Arc<RwLock<HashMap<String, Uuid>>>,
}

impl MemoryRoomStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn entry(&self, room_id: Uuid) -> AppResult<Arc<Mutex<Room>>> {
        self.rooms
            .read()
            .await
            .get(&room_id)
            .cloned()
            .ok_or_else(|| room_not_found(room_id))
    }
}

#[async_trait]
impl RoomStore for MemoryRoomStore {
    async fn insert_room(&self, room: &Room) -> AppResult<bool> {
        let code = normalize_code(&room.code);
        let mut codes = self.codes.write().await;
        if codes.contains_key(&code) {
            return Ok(false);
        }
        let mut stored = room.clone();
        stored.code = code.clone();
        codes.insert(code, room.id);
        self.rooms
            .write()
            .await
            .insert(room.id, Arc::new(Mutex::new(stored)));
        Ok(true)
    }

    async fn find_active_by_code(&self, code: &str) -> AppResult<Option<Room>> {
        let id = match self.codes.read().await.get(&normalize_code(code)) {
            Some(id) => *id,
            None => return Ok(None),
        };
        let entry = match self.rooms.read().await.get(&id) {
            Some(entry) => entry.clone(),
            None => return Ok(None),
        };
        let room = entry.lock().await;
        Ok(room.is_active.then(|| room.clone()))
    }

    async fn get_room(&self, room_id: Uuid) -> AppResult<Option<Room>> {
        let entry = match self.rooms.read().await.get(&room_id) {
            Some(entry) => entry.clone(),
            None => return Ok(None),
        };
        let room = entry.lock().await;
        Ok(Some(room.clone()))
    }

    async fn add_participant(
        &self,
        room_id: Uuid,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<(Room, bool)> {
        let entry = self.entry(room_id).await?;
        let mut room = entry.lock().await;
        if !room.is_active {
            return Err(room_not_found(room_id));
        }
        let added = room.add_participant(user_id, now);
        Ok((room.clone(), added))
    }

    async fn rooms_for_user(&self, user_id: &str) -> AppResult<Vec<Room>> {
        let entries: Vec<_> = self.rooms.read().await.values().cloned().collect();
        let mut rooms = Vec::new();
        for entry in entries {
            let room = entry.lock().await;
            if room.is_active && room.is_participant(user_id) {
                rooms.push(room.clone());
            }
        }
        rooms.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(rooms)
    }

    async fn mutate_cart(
        &self,
        room_id: Uuid,
        now: DateTime<Utc>,
        budget: Duration,
        mutation: CartMutation<'_>,
    ) -> AppResult<Room> {
        let entry = self.entry(room_id).await?;
        let mut room = tokio::time::timeout(budget, entry.lock())
            .await
            .map_err(|_| store_timeout(budget))?;
        if !room.is_active {
            return Err(room_not_found(room_id));
        }
        let lines = mutation(&room)?;
        room.shared_cart = lines;
        room.updated_at = now;
        Ok(room.clone())
    }

    async fn append_message(&self, room_id: Uuid, message: &ChatMessage) -> AppResult<()> {
        let entry = self.entry(room_id).await?;
        let mut room = entry.lock().await;
        if !room.is_active {
            return Err(room_not_found(room_id));
        }
        room.chat_history.push(message.clone());
        room.updated_at = message.timestamp;
        Ok(())
    }

    async fn deactivate(&self, room_id: Uuid, now: DateTime<Utc>) -> AppResult<()> {
        let entry = self.entry(room_id).await?;
        let mut room = entry.lock().await;
        if room.is_active {
            room.is_active = false;
            room.updated_at = now;
            let mut codes = self.codes.write().await;
            if codes.get(&room.code) == Some(&room_id) {
                codes.remove(&room.code);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Identity;
    use crate::models::{generate_room_code, reconcile, CartOperation, ProductSnapshot};

    const BUDGET: Duration = Duration::from_secs(5);

    fn room(code: &str) -> Room {
        Room::new("Groceries", "alice", code.to_string(), Utc::now())
    }

    #[tokio::test]
    async fn duplicate_active_code_is_refused() {
        let store = MemoryRoomStore::new();
        assert!(store.insert_room(&room("ABCD1234")).await.unwrap());
        assert!(!store.insert_room(&room("abcd1234")).await.unwrap());
    }

    #[tokio::test]
    async fn code_lookup_ignores_case_and_inactive_rooms() {
        let store = MemoryRoomStore::new();
        let r = room("ABCD1234");
        store.insert_room(&r).await.unwrap();
        let found = store.find_active_by_code("abcd1234").await.unwrap();
        assert_eq!(found.map(|f| f.id), Some(r.id));

        store.deactivate(r.id, Utc::now()).await.unwrap();
        assert!(store.find_active_by_code("ABCD1234").await.unwrap().is_none());
        // code is free again once the holder is inactive
        assert!(store.insert_room(&room("ABCD1234")).await.unwrap());
    }

    #[tokio::test]
    async fn add_participant_reports_new_members_only() {
        let store = MemoryRoomStore::new();
        let r = room(&generate_room_code());
        store.insert_room(&r).await.unwrap();
        let (_, added) = store.add_participant(r.id, "bob", Utc::now()).await.unwrap();
        assert!(added);
        let (room, added) = store.add_participant(r.id, "bob", Utc::now()).await.unwrap();
        assert!(!added);
        assert_eq!(room.participants.len(), 2);
    }

    #[tokio::test]
    async fn failed_mutation_leaves_cart_untouched() {
        let store = MemoryRoomStore::new();
        let r = room(&generate_room_code());
        store.insert_room(&r).await.unwrap();
        let op = CartOperation::Add {
            product_id: "P".to_string(),
            quantity: Some(2),
            snapshot: ProductSnapshot::placeholder("P"),
        };
        store
            .mutate_cart(r.id, Utc::now(), BUDGET, &|room: &Room| {
                Ok::<_, AppError>(reconcile(&room.shared_cart, &op, "alice", Utc::now()))
            })
            .await
            .unwrap();
        let err = store
            .mutate_cart(r.id, Utc::now(), BUDGET, &|_: &Room| {
                Err(AppError::Validation("rejected".to_string()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        let stored = store.get_room(r.id).await.unwrap().unwrap();
        assert_eq!(stored.shared_cart.len(), 1);
        assert_eq!(stored.shared_cart[0].quantity, 2);
    }

    #[tokio::test]
    async fn mutation_waiting_past_its_budget_changes_nothing() {
        let store = MemoryRoomStore::new();
        let r = room(&generate_room_code());
        store.insert_room(&r).await.unwrap();
        let entry = store.entry(r.id).await.unwrap();
        let held = entry.lock().await;

        let op = CartOperation::Add {
            product_id: "P".to_string(),
            quantity: Some(1),
            snapshot: ProductSnapshot::placeholder("P"),
        };
        let err = store
            .mutate_cart(r.id, Utc::now(), Duration::from_millis(20), &|room: &Room| {
                Ok::<_, AppError>(reconcile(&room.shared_cart, &op, "alice", Utc::now()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Persistence(_)));
        drop(held);
        assert!(store.get_room(r.id).await.unwrap().unwrap().shared_cart.is_empty());
    }

    #[tokio::test]
    async fn chat_into_deactivated_room_is_not_found() {
        let store = MemoryRoomStore::new();
        let r = room(&generate_room_code());
        store.insert_room(&r).await.unwrap();
        store.deactivate(r.id, Utc::now()).await.unwrap();

        let msg = ChatMessage::new(&Identity::new("alice", "Alice"), "anyone?", Utc::now()).unwrap();
        let err = store.append_message(r.id, &msg).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert!(store.get_room(r.id).await.unwrap().unwrap().chat_history.is_empty());
    }

    #[tokio::test]
    async fn rooms_for_user_lists_active_memberships_newest_first() {
        let store = MemoryRoomStore::new();
        let older = room(&generate_room_code());
        store.insert_room(&older).await.unwrap();
        let mut newer = room(&generate_room_code());
        newer.updated_at = older.updated_at + chrono::Duration::seconds(5);
        store.insert_room(&newer).await.unwrap();
        let gone = room(&generate_room_code());
        store.insert_room(&gone).await.unwrap();
        store.deactivate(gone.id, Utc::now()).await.unwrap();

        let ids: Vec<_> = store
            .rooms_for_user("alice")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![newer.id, older.id]);
        assert!(store.rooms_for_user("bob").await.unwrap().is_empty());
    }
}
