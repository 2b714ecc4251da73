//! Room broadcast: local fan-out to subscribed connections, optionally relayed
//! through Redis so every server process sees every room frame.
//!
//! Frames for one room are delivered to all local subscribers while holding that
//! room's fan-out lock, so every subscriber observes the same order. Rooms do
//! not share a lock.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::{ServerEvent, WsEvent};
use crate::repositories::RedisRepository;

/// Frames a connection may have queued before it is treated as stalled.
pub const OUTBOUND_CAPACITY: usize = 64;

/// Outbound queue of one connection. Frames are serialized JSON.
///
/// The queue is bounded. A push that finds it full is dropped and raises the
/// overflow signal, which the socket handler turns into a disconnect.
#[derive(Clone, Debug)]
pub struct Outbound {
    tx: mpsc::Sender<String>,
    overflow: Arc<Notify>,
}

impl Outbound {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        let outbound = Self {
            tx,
            overflow: Arc::new(Notify::new()),
        };
        (outbound, rx)
    }

    /// Queue a frame without waiting. Returns false if the frame was not queued.
    pub fn push(&self, frame: String) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.overflow.notify_one();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Resolves once a push has found the queue full.
    pub async fn overflowed(&self) {
        self.overflow.notified().await
    }
}

/// What travels over the Redis relay.
#[derive(Debug, Serialize, Deserialize)]
struct RelayEnvelope {
    room_id: Uuid,
    /// Connection that must not receive the frame.
    exclude: Option<String>,
    frame: String,
}

#[derive(Default)]
struct RoomFanout {
    sockets: HashMap<String, Outbound>,
    relay_task: Option<JoinHandle<()>>,
}

impl RoomFanout {
    fn deliver(&mut self, frame: &str, exclude: Option<&str>) -> usize {
        let mut delivered = 0;
        self.sockets.retain(|socket_id, tx| {
            if Some(socket_id.as_str()) == exclude {
                return true;
            }
            // closed or stalled connection: drop it
            if !tx.push(frame.to_string()) {
                debug!(socket_id = %socket_id, "dropping subscriber that cannot take frames");
                return false;
            }
            delivered += 1;
            true
        });
        delivered
    }
}

#[derive(Clone, Default)]
pub struct ChannelService {
    rooms: Arc<RwLock<HashMap<Uuid, Arc<Mutex<RoomFanout>>>>>,
    relay: Option<Arc<RedisRepository>>,
}

impl ChannelService {
    /// In-process fan-out only.
    pub fn local() -> Self {
        Self::default()
    }

    /// Fan-out relayed through Redis pub/sub.
    pub fn with_relay(repo: Arc<RedisRepository>) -> Self {
        Self {
            rooms: Arc::default(),
            relay: Some(repo),
        }
    }

    async fn fanout(&self, room_id: Uuid) -> Option<Arc<Mutex<RoomFanout>>> {
        self.rooms.read().await.get(&room_id).cloned()
    }

    /// Register a connection as a subscriber of a room.
    pub async fn subscribe(&self, room_id: Uuid, socket_id: &str, tx: Outbound) -> AppResult<()> {
        let mut rooms = self.rooms.write().await;
        let entry = rooms.entry(room_id).or_default().clone();
        // insert before releasing the map so a concurrent last unsubscribe cannot orphan it
        let mut fanout = entry.lock().await;
        fanout.sockets.insert(socket_id.to_string(), tx);
        drop(rooms);

        if fanout.relay_task.is_none() {
            if let Some(repo) = &self.relay {
                let mut stream = match repo.subscribe_room(room_id).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        drop(fanout);
                        self.unsubscribe(room_id, socket_id).await;
                        return Err(e);
                    }
                };
                let this = self.clone();
                fanout.relay_task = Some(tokio::spawn(async move {
                    while let Some(raw) = stream.next().await {
                        match serde_json::from_str::<RelayEnvelope>(&raw) {
                            Ok(env) if env.room_id == room_id => {
                                this.deliver_local(room_id, &env.frame, env.exclude.as_deref())
                                    .await;
                            }
                            Ok(_) => {}
                            Err(e) => warn!(room_id = %room_id, error = %e, "bad relay frame"),
                        }
                    }
                    debug!(room_id = %room_id, "relay stream ended");
                }));
            }
        }
        debug!(room_id = %room_id, socket_id = %socket_id, subscribers = fanout.sockets.len(), "subscribed");
        Ok(())
    }

    /// Remove a connection from a room. The room's fan-out (and relay
    /// subscription) is dropped with its last subscriber.
    pub async fn unsubscribe(&self, room_id: Uuid, socket_id: &str) {
        let mut rooms = self.rooms.write().await;
        let Some(fanout) = rooms.get(&room_id).cloned() else {
            return;
        };
        let mut fanout = fanout.lock().await;
        fanout.sockets.remove(socket_id);
        if fanout.sockets.is_empty() {
            if let Some(task) = fanout.relay_task.take() {
                task.abort();
            }
            rooms.remove(&room_id);
            info!(room_id = %room_id, "room has no local subscribers");
        }
        debug!(room_id = %room_id, socket_id = %socket_id, "unsubscribed");
    }

    /// Send an event to every subscriber of the room except `exclude`.
    pub async fn broadcast(
        &self,
        room_id: Uuid,
        event: ServerEvent,
        exclude: Option<&str>,
    ) -> AppResult<()> {
        let frame = WsEvent::for_room(room_id, event).to_json()?;

        if let Some(repo) = &self.relay {
            let envelope = serde_json::to_string(&RelayEnvelope {
                room_id,
                exclude: exclude.map(str::to_string),
                frame: frame.clone(),
            })?;
            match repo.publish(room_id, &envelope).await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    warn!(room_id = %room_id, error = %e, "relay publish failed, delivering locally");
                }
            }
        }

        let delivered = self.deliver_local(room_id, &frame, exclude).await;
        debug!(room_id = %room_id, delivered, "broadcast");
        Ok(())
    }

    async fn deliver_local(&self, room_id: Uuid, frame: &str, exclude: Option<&str>) -> usize {
        match self.fanout(room_id).await {
            Some(fanout) => fanout.lock().await.deliver(frame, exclude),
            None => 0,
        }
    }

    pub async fn subscriber_count(&self, room_id: Uuid) -> usize {
        match self.fanout(room_id).await {
            Some(fanout) => fanout.lock().await.sockets.len(),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{UserLeft, UserTyping};

    fn typing(user: &str) -> ServerEvent {
        ServerEvent::UserTyping(UserTyping {
            user_id: user.to_string(),
            username: user.to_string(),
            is_typing: true,
        })
    }

    #[tokio::test]
    async fn broadcast_skips_excluded_connection() {
        let channels = ChannelService::local();
        let room = Uuid::new_v4();
        let (tx_a, mut rx_a) = Outbound::channel(OUTBOUND_CAPACITY);
        let (tx_b, mut rx_b) = Outbound::channel(OUTBOUND_CAPACITY);
        channels.subscribe(room, "a", tx_a).await.unwrap();
        channels.subscribe(room, "b", tx_b).await.unwrap();

        channels.broadcast(room, typing("alice"), Some("a")).await.unwrap();

        let frame: serde_json::Value = serde_json::from_str(&rx_b.recv().await.unwrap()).unwrap();
        assert_eq!(frame["event"], "user-typing");
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn frames_arrive_in_publish_order() {
        let channels = ChannelService::local();
        let room = Uuid::new_v4();
        let (tx, mut rx) = Outbound::channel(OUTBOUND_CAPACITY);
        channels.subscribe(room, "a", tx).await.unwrap();
        for user in ["u1", "u2", "u3"] {
            channels
                .broadcast(
                    room,
                    ServerEvent::UserLeft(UserLeft {
                        user_id: user.to_string(),
                        username: None,
                    }),
                    None,
                )
                .await
                .unwrap();
        }
        for user in ["u1", "u2", "u3"] {
            let frame: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
            assert_eq!(frame["data"]["userId"], user);
        }
    }

    #[tokio::test]
    async fn rooms_are_isolated_and_dropped_with_last_subscriber() {
        let channels = ChannelService::local();
        let (r1, r2) = (Uuid::new_v4(), Uuid::new_v4());
        let (tx, mut rx) = Outbound::channel(OUTBOUND_CAPACITY);
        channels.subscribe(r1, "a", tx).await.unwrap();

        channels.broadcast(r2, typing("bob"), None).await.unwrap();
        assert!(rx.try_recv().is_err());

        channels.unsubscribe(r1, "a").await;
        assert_eq!(channels.subscriber_count(r1).await, 0);
        channels.broadcast(r1, typing("bob"), None).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stalled_connection_is_pruned_and_signalled() {
        let channels = ChannelService::local();
        let room = Uuid::new_v4();
        let (slow, _rx_slow) = Outbound::channel(2);
        let (fast, mut rx_fast) = Outbound::channel(OUTBOUND_CAPACITY);
        channels.subscribe(room, "slow", slow.clone()).await.unwrap();
        channels.subscribe(room, "fast", fast).await.unwrap();

        for _ in 0..3 {
            channels.broadcast(room, typing("bob"), None).await.unwrap();
        }

        assert_eq!(channels.subscriber_count(room).await, 1);
        tokio::time::timeout(std::time::Duration::from_secs(1), slow.overflowed())
            .await
            .expect("overflow signalled");
        for _ in 0..3 {
            assert!(rx_fast.try_recv().is_ok());
        }
    }

    #[tokio::test]
    async fn closed_connection_is_pruned_on_delivery() {
        let channels = ChannelService::local();
        let room = Uuid::new_v4();
        let (tx, rx) = Outbound::channel(OUTBOUND_CAPACITY);
        channels.subscribe(room, "gone", tx).await.unwrap();
        drop(rx);
        channels.broadcast(room, typing("bob"), None).await.unwrap();
        assert_eq!(channels.subscriber_count(room).await, 0);
    }
}
