//! Room operations: the Room Store behind per-room serialization, store
//! timeouts and broadcast of the resulting state.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::auth::Identity;
use crate::error::{AppError, AppResult};
use crate::models::{
    generate_room_code, reconcile, CartLine, CartOperation, CartUpdated, CartView, ChatMessage,
    NewMessage, Room, ServerEvent,
};
use crate::services::channel::ChannelService;
use crate::services::checkout::{build_snapshot, CheckoutRequest, CheckoutSnapshot, PricingPolicy};
use crate::services::store::{store_timeout, RoomStore};

const MAX_ROOM_NAME_LEN: usize = 100;
const CODE_ATTEMPTS: usize = 5;

type LockMap = Arc<StdMutex<HashMap<Uuid, Arc<Mutex<()>>>>>;

/// Held while a room is being mutated. Removes the room's lock from the map on
/// drop when nobody else is waiting for it.
struct RoomLock {
    room_id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
    locks: LockMap,
}

impl Drop for RoomLock {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        let mutex = OwnedMutexGuard::mutex(&guard).clone();
        drop(guard);
        if let Ok(mut locks) = self.locks.lock() {
            // map + `mutex` above
            if Arc::strong_count(&mutex) == 2 {
                locks.remove(&self.room_id);
            }
        }
    }
}

#[derive(Clone)]
pub struct RoomService {
    store: Arc<dyn RoomStore>,
    channels: ChannelService,
    pricing: PricingPolicy,
    store_timeout: Duration,
    locks: LockMap,
}

impl RoomService {
    pub fn new(
        store: Arc<dyn RoomStore>,
        channels: ChannelService,
        pricing: PricingPolicy,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            channels,
            pricing,
            store_timeout,
            locks: Arc::default(),
        }
    }

    pub fn channels(&self) -> &ChannelService {
        &self.channels
    }

    async fn lock_room(&self, room_id: Uuid) -> RoomLock {
        let mutex = {
            let mut locks = match self.locks.lock() {
                Ok(locks) => locks,
                Err(poisoned) => poisoned.into_inner(),
            };
            locks.entry(room_id).or_default().clone()
        };
        RoomLock {
            room_id,
            guard: Some(mutex.lock_owned().await),
            locks: self.locks.clone(),
        }
    }

    /// Bound a store call by the configured timeout.
    async fn bounded<T>(&self, call: impl Future<Output = AppResult<T>>) -> AppResult<T> {
        match tokio::time::timeout(self.store_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(store_timeout(self.store_timeout)),
        }
    }

    #[instrument(skip(self))]
    pub async fn create_room(&self, name: &str, creator_id: &str) -> AppResult<Room> {
        let name = name.trim();
        if name.is_empty() || name.chars().count() > MAX_ROOM_NAME_LEN {
            return Err(AppError::Validation(format!(
                "room name must be 1 to {} characters",
                MAX_ROOM_NAME_LEN
            )));
        }
        for _ in 0..CODE_ATTEMPTS {
            let room = Room::new(name, creator_id, generate_room_code(), Utc::now());
            if self.bounded(self.store.insert_room(&room)).await? {
                info!(room_id = %room.id, code = %room.code, "room created");
                return Ok(room);
            }
            warn!(code = %room.code, "room code collision, retrying");
        }
        Err(AppError::Persistence(
            "could not allocate a unique room code".to_string(),
        ))
    }

    /// Join by code. Returns the room and whether the user is a new participant.
    #[instrument(skip(self))]
    pub async fn join_room_by_code(&self, code: &str, user_id: &str) -> AppResult<(Room, bool)> {
        let room = self
            .bounded(self.store.find_active_by_code(code))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("no active room with code '{}'", code.trim())))?;
        if room.is_participant(user_id) {
            return Ok((room, false));
        }
        let (room, added) = self
            .bounded(self.store.add_participant(room.id, user_id, Utc::now()))
            .await?;
        if added {
            info!(room_id = %room.id, "participant added");
        }
        Ok((room, added))
    }

    /// Active room, without a membership check.
    pub async fn find_active_room(&self, room_id: Uuid) -> AppResult<Room> {
        match self.bounded(self.store.get_room(room_id)).await? {
            Some(room) if room.is_active => Ok(room),
            _ => Err(AppError::NotFound(format!("room {}", room_id))),
        }
    }

    pub async fn get_room(&self, room_id: Uuid, requesting_user: &str) -> AppResult<Room> {
        let room = self.find_active_room(room_id).await?;
        room.ensure_participant(requesting_user)?;
        Ok(room)
    }

    pub async fn list_rooms_for_user(&self, user_id: &str) -> AppResult<Vec<Room>> {
        self.bounded(self.store.rooms_for_user(user_id)).await
    }

    /// Reconcile, persist and broadcast `cart-updated` to every subscriber of the
    /// room, the actor included. Nothing is broadcast when persistence fails.
    #[instrument(skip(self, actor, op), fields(user_id = %actor.user_id, action = ?op.action()))]
    pub async fn apply_cart_operation(
        &self,
        room_id: Uuid,
        actor: &Identity,
        op: CartOperation,
    ) -> AppResult<CartView> {
        let _lock = self.lock_room(room_id).await;
        let now = Utc::now();
        let actor_id = actor.user_id.clone();
        let mutation = |room: &Room| -> AppResult<Vec<CartLine>> {
            room.ensure_participant(&actor_id)?;
            Ok(reconcile(&room.shared_cart, &op, &actor_id, now))
        };
        // the store bounds its own pre-commit work; see RoomStore::mutate_cart
        let room = self
            .store
            .mutate_cart(room_id, now, self.store_timeout, &mutation)
            .await?;

        let view = CartView::project(&room.shared_cart);
        let event = CartUpdated::new(view.clone(), &actor.user_id, op.action(), op.product_id());
        self.channels
            .broadcast(room_id, ServerEvent::CartUpdated(event), None)
            .await?;
        info!(lines = view.items.len(), subtotal = view.subtotal, "cart updated");
        Ok(view)
    }

    /// Persist and broadcast a chat message to every subscriber. A persistence
    /// failure is logged and the message is broadcast anyway; a room that is no
    /// longer active gets `NotFound` and no broadcast.
    #[instrument(skip(self, author, body), fields(user_id = %author.user_id))]
    pub async fn post_chat_message(
        &self,
        room_id: Uuid,
        author: &Identity,
        body: &str,
    ) -> AppResult<ChatMessage> {
        let message = ChatMessage::new(author, body, Utc::now())?;
        let _lock = self.lock_room(room_id).await;
        match self.append_chat_message(room_id, &message).await {
            Ok(()) => {}
            Err(e @ AppError::NotFound(_)) => return Err(e),
            Err(e) => warn!(room_id = %room_id, error = %e, "chat message not persisted"),
        }
        let event = NewMessage {
            message: message.body.clone(),
            user_id: message.author_id.clone(),
            username: message.username.clone(),
            timestamp: message.timestamp,
        };
        self.channels
            .broadcast(room_id, ServerEvent::NewMessage(event), None)
            .await?;
        Ok(message)
    }

    pub async fn append_chat_message(&self, room_id: Uuid, message: &ChatMessage) -> AppResult<()> {
        self.bounded(self.store.append_message(room_id, message)).await
    }

    #[instrument(skip(self))]
    pub async fn delete_room(&self, room_id: Uuid, requesting_user: &str) -> AppResult<()> {
        let room = self.find_active_room(room_id).await?;
        room.ensure_creator(requesting_user)?;
        self.bounded(self.store.deactivate(room_id, Utc::now())).await?;
        info!(room_id = %room_id, "room deactivated");
        Ok(())
    }

    /// Priced snapshot for the order service, taken under the room's mutation lock.
    #[instrument(skip(self, request))]
    pub async fn checkout(
        &self,
        room_id: Uuid,
        requester: &str,
        request: CheckoutRequest,
    ) -> AppResult<CheckoutSnapshot> {
        let _lock = self.lock_room(room_id).await;
        let room = self.find_active_room(room_id).await?;
        let snapshot = build_snapshot(&room, requester, request, &self.pricing, Utc::now())?;
        info!(total = snapshot.totals.total, splits = snapshot.payment_splits.len(), "checkout snapshot built");
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProductSnapshot;
    use crate::services::channel::{Outbound, OUTBOUND_CAPACITY};
    use crate::services::store::{CartMutation, MemoryRoomStore};
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio_test::{assert_err, assert_ok};

    /// Memory store whose writes can be switched to fail, or answer late after committing.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryRoomStore,
        failing: AtomicBool,
        reply_delay: Duration,
    }

    impl FlakyStore {
        fn check(&self) -> AppResult<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(AppError::Persistence("database unavailable".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl RoomStore for FlakyStore {
        async fn insert_room(&self, room: &Room) -> AppResult<bool> {
            self.inner.insert_room(room).await
        }
        async fn find_active_by_code(&self, code: &str) -> AppResult<Option<Room>> {
            self.inner.find_active_by_code(code).await
        }
        async fn get_room(&self, room_id: Uuid) -> AppResult<Option<Room>> {
            self.inner.get_room(room_id).await
        }
        async fn add_participant(
            &self,
            room_id: Uuid,
            user_id: &str,
            now: DateTime<Utc>,
        ) -> AppResult<(Room, bool)> {
            self.inner.add_participant(room_id, user_id, now).await
        }
        async fn rooms_for_user(&self, user_id: &str) -> AppResult<Vec<Room>> {
            self.inner.rooms_for_user(user_id).await
        }
        async fn mutate_cart(
            &self,
            room_id: Uuid,
            now: DateTime<Utc>,
            budget: Duration,
            mutation: CartMutation<'_>,
        ) -> AppResult<Room> {
            self.check()?;
            let room = self.inner.mutate_cart(room_id, now, budget, mutation).await?;
            // committed; the reply is what is slow
            tokio::time::sleep(self.reply_delay).await;
            Ok(room)
        }
        async fn append_message(&self, room_id: Uuid, message: &ChatMessage) -> AppResult<()> {
            self.check()?;
            self.inner.append_message(room_id, message).await
        }
        async fn deactivate(&self, room_id: Uuid, now: DateTime<Utc>) -> AppResult<()> {
            self.inner.deactivate(room_id, now).await
        }
    }

    fn service_with(store: Arc<dyn RoomStore>) -> RoomService {
        RoomService::new(
            store,
            ChannelService::local(),
            PricingPolicy::default(),
            Duration::from_secs(5),
        )
    }

    fn service() -> RoomService {
        service_with(Arc::new(MemoryRoomStore::new()))
    }

    fn add(product: &str, quantity: i64) -> CartOperation {
        CartOperation::Add {
            product_id: product.to_string(),
            quantity: Some(quantity),
            snapshot: ProductSnapshot {
                name: format!("Product {}", product),
                price: 2.5,
                images: vec![],
                description: None,
            },
        }
    }

    #[tokio::test]
    async fn join_by_code_is_idempotent() {
        let rooms = service();
        let room = assert_ok!(rooms.create_room("Party supplies", "alice").await);
        let (_, added) = assert_ok!(rooms.join_room_by_code(&room.code.to_lowercase(), "bob").await);
        assert!(added);
        let (joined, added) = assert_ok!(rooms.join_room_by_code(&room.code, "bob").await);
        assert!(!added);
        assert_eq!(joined.participants.len(), 2);
        let creator_again = rooms.join_room_by_code(&room.code, "alice").await.unwrap();
        assert!(!creator_again.1);
    }

    #[tokio::test]
    async fn unknown_code_is_not_found() {
        let rooms = service();
        let err = assert_err!(rooms.join_room_by_code("ZZZZZZZZ", "bob").await);
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn blank_room_name_is_rejected() {
        let rooms = service();
        assert!(matches!(
            rooms.create_room("   ", "alice").await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn non_participant_cannot_read_or_mutate() {
        let rooms = service();
        let room = rooms.create_room("r", "alice").await.unwrap();
        let mallory = Identity::new("mallory", "Mallory");
        assert!(matches!(
            rooms.get_room(room.id, "mallory").await,
            Err(AppError::Forbidden(_))
        ));
        assert!(matches!(
            rooms.apply_cart_operation(room.id, &mallory, add("P", 1)).await,
            Err(AppError::Forbidden(_))
        ));
        let stored = rooms.get_room(room.id, "alice").await.unwrap();
        assert!(stored.shared_cart.is_empty());
    }

    #[tokio::test]
    async fn cart_update_reaches_the_originator() {
        let rooms = service();
        let room = rooms.create_room("r", "alice").await.unwrap();
        let (tx, mut rx) = Outbound::channel(OUTBOUND_CAPACITY);
        rooms.channels().subscribe(room.id, "alice-socket", tx).await.unwrap();

        let alice = Identity::new("alice", "Alice");
        let view = rooms.apply_cart_operation(room.id, &alice, add("P", 2)).await.unwrap();
        assert_eq!(view.item_count, 2);

        let frame: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["event"], "cart-updated");
        assert_eq!(frame["data"]["updatedBy"], "alice");
        assert_eq!(frame["data"]["action"], "add");
        assert_eq!(frame["data"]["subtotal"], 5.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_adds_are_not_lost() {
        let rooms = service();
        let room = rooms.create_room("r", "alice").await.unwrap();
        rooms.join_room_by_code(&room.code, "bob").await.unwrap();

        let mut tasks = Vec::new();
        for (i, user) in ["alice", "bob"].iter().cycle().take(20).enumerate() {
            let rooms = rooms.clone();
            let who = Identity::new(*user, *user);
            tasks.push(tokio::spawn(async move {
                rooms
                    .apply_cart_operation(room.id, &who, add("P", 1 + (i as i64 % 2)))
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        let stored = rooms.get_room(room.id, "alice").await.unwrap();
        assert_eq!(stored.shared_cart.len(), 1);
        // ten adds of 1 and ten adds of 2
        assert_eq!(stored.shared_cart[0].quantity, 30);
    }

    #[tokio::test]
    async fn persistence_failure_keeps_prior_cart_and_broadcasts_nothing() {
        let store = Arc::new(FlakyStore::default());
        let rooms = service_with(store.clone());
        let room = rooms.create_room("r", "alice").await.unwrap();
        let alice = Identity::new("alice", "Alice");
        rooms.apply_cart_operation(room.id, &alice, add("P", 1)).await.unwrap();

        let (tx, mut rx) = Outbound::channel(OUTBOUND_CAPACITY);
        rooms.channels().subscribe(room.id, "watcher", tx).await.unwrap();
        store.failing.store(true, Ordering::SeqCst);

        let err = rooms
            .apply_cart_operation(room.id, &alice, add("P", 5))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Persistence(_)));
        assert!(rx.try_recv().is_err());

        store.failing.store(false, Ordering::SeqCst);
        let stored = rooms.get_room(room.id, "alice").await.unwrap();
        assert_eq!(stored.shared_cart[0].quantity, 1);
    }

    #[tokio::test]
    async fn chat_is_broadcast_even_when_not_persisted() {
        let store = Arc::new(FlakyStore {
            failing: AtomicBool::new(true),
            ..Default::default()
        });
        let rooms = service_with(store);
        let room = rooms.create_room("r", "alice").await.unwrap();
        let (tx, mut rx) = Outbound::channel(OUTBOUND_CAPACITY);
        rooms.channels().subscribe(room.id, "s", tx).await.unwrap();

        let alice = Identity::new("alice", "Alice");
        rooms.post_chat_message(room.id, &alice, "hello").await.unwrap();

        let frame: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["event"], "new-message");
        assert_eq!(frame["data"]["message"], "hello");
        let stored = rooms.get_room(room.id, "alice").await.unwrap();
        assert!(stored.chat_history.is_empty());
    }

    #[tokio::test]
    async fn late_commit_reply_still_reports_and_broadcasts_the_new_cart() {
        let store = Arc::new(FlakyStore {
            reply_delay: Duration::from_millis(60),
            ..Default::default()
        });
        let rooms = RoomService::new(
            store,
            ChannelService::local(),
            PricingPolicy::default(),
            Duration::from_millis(20),
        );
        let room = rooms.create_room("r", "alice").await.unwrap();
        let (tx, mut rx) = Outbound::channel(OUTBOUND_CAPACITY);
        rooms.channels().subscribe(room.id, "bob-socket", tx).await.unwrap();

        let alice = Identity::new("alice", "Alice");
        let view = rooms.apply_cart_operation(room.id, &alice, add("P", 3)).await.unwrap();
        assert_eq!(view.item_count, 3);

        let frame: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["event"], "cart-updated");
        assert_eq!(frame["data"]["itemCount"], 3);
    }

    #[tokio::test]
    async fn chat_into_deleted_room_is_not_found_and_not_broadcast() {
        let rooms = service();
        let room = rooms.create_room("r", "alice").await.unwrap();
        let (tx, mut rx) = Outbound::channel(OUTBOUND_CAPACITY);
        rooms.channels().subscribe(room.id, "s", tx).await.unwrap();
        rooms.delete_room(room.id, "alice").await.unwrap();

        let alice = Identity::new("alice", "Alice");
        let err = rooms
            .post_chat_message(room.id, &alice, "still here?")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn only_creator_deletes_and_deleted_room_is_gone() {
        let rooms = service();
        let room = rooms.create_room("r", "alice").await.unwrap();
        rooms.join_room_by_code(&room.code, "bob").await.unwrap();
        assert!(matches!(
            rooms.delete_room(room.id, "bob").await,
            Err(AppError::Forbidden(_))
        ));
        rooms.delete_room(room.id, "alice").await.unwrap();
        assert!(matches!(
            rooms.get_room(room.id, "alice").await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            rooms.join_room_by_code(&room.code, "carol").await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn checkout_prices_the_shared_cart() {
        let rooms = service();
        let room = rooms.create_room("r", "alice").await.unwrap();
        let alice = Identity::new("alice", "Alice");
        rooms.apply_cart_operation(room.id, &alice, add("P", 4)).await.unwrap();
        let snap = rooms
            .checkout(room.id, "alice", CheckoutRequest::default())
            .await
            .unwrap();
        assert_eq!(snap.totals.subtotal, 10.0);
        assert_eq!(snap.totals.shipping, 5.99);
        assert_eq!(snap.items[0].quantity, 4);
    }

    #[tokio::test]
    async fn slow_store_times_out_as_persistence_failure() {
        struct StuckStore;

        #[async_trait]
        impl RoomStore for StuckStore {
            async fn insert_room(&self, _: &Room) -> AppResult<bool> {
                futures::future::pending().await
            }
            async fn find_active_by_code(&self, _: &str) -> AppResult<Option<Room>> {
                futures::future::pending().await
            }
            async fn get_room(&self, _: Uuid) -> AppResult<Option<Room>> {
                futures::future::pending().await
            }
            async fn add_participant(&self, _: Uuid, _: &str, _: DateTime<Utc>) -> AppResult<(Room, bool)> {
                futures::future::pending().await
            }
            async fn rooms_for_user(&self, _: &str) -> AppResult<Vec<Room>> {
                futures::future::pending().await
            }
            async fn mutate_cart(
                &self,
                _: Uuid,
                _: DateTime<Utc>,
                _: Duration,
                _: CartMutation<'_>,
            ) -> AppResult<Room> {
                futures::future::pending().await
            }
            async fn append_message(&self, _: Uuid, _: &ChatMessage) -> AppResult<()> {
                futures::future::pending().await
            }
            async fn deactivate(&self, _: Uuid, _: DateTime<Utc>) -> AppResult<()> {
                futures::future::pending().await
            }
        }

        let rooms = RoomService::new(
            Arc::new(StuckStore),
            ChannelService::local(),
            PricingPolicy::default(),
            Duration::from_millis(20),
        );
        let err = rooms.create_room("r", "alice").await.unwrap_err();
        assert!(matches!(err, AppError::Persistence(_)));
    }
}
