//! Redis pub/sub relay for room broadcasts shared between server processes.

use crate::error::AppError;
use futures::stream::BoxStream;
use futures::StreamExt;
use redis::AsyncCommands;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

const ROOM_CHANNEL_PREFIX: &str = "cartroom:room:";

fn room_key(room_id: Uuid) -> String {
    format!("{}{}", ROOM_CHANNEL_PREFIX, room_id)
}

#[derive(Clone)]
pub struct RedisRepository {
    client: Arc<redis::Client>,
}

impl RedisRepository {
    pub fn new(redis_url: &str) -> Result<Self, AppError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    /// Get a multiplexed connection for commands.
    pub async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, AppError> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        Ok(conn)
    }

    /// Publish a room frame (Redis PUBLISH). Returns the number of receiving processes.
    pub async fn publish(&self, room_id: Uuid, message: &str) -> Result<u64, AppError> {
        let mut conn = self.connection().await?;
        let count: u64 = conn.publish(room_key(room_id), message).await?;
        debug!(room_id = %room_id, count, "published");
        Ok(count)
    }

    /// Subscribe to a room's relay channel on a dedicated connection. Dropping the
    /// stream closes the subscription.
    pub async fn subscribe_room(&self, room_id: Uuid) -> Result<BoxStream<'static, String>, AppError> {
        let conn = self.client.get_async_connection().await?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(room_key(room_id)).await?;
        info!(room_id = %room_id, "subscribed to redis room channel");

        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| futures::future::ready(msg.get_payload::<String>().ok()));
        Ok(stream.boxed())
    }
}
