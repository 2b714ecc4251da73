//! PostgreSQL room store: rooms, participants, cart lines and chat messages.
//!
//! Writes that read-modify-write a room take a row lock on `rooms` first, so
//! several server processes sharing one database stay serialized per room.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, Postgres, Transaction};
use std::time::Duration;
use uuid::Uuid;

use super::DbPool;
use crate::error::{AppError, AppResult};
use crate::models::{normalize_code, CartLine, ChatMessage, Participant, ProductSnapshot, Room};
use crate::services::store::{store_timeout, CartMutation, RoomStore};

#[derive(Debug, FromRow)]
struct RoomRow {
    id: Uuid,
    code: String,
    name: String,
    creator_id: String,
    is_active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct ParticipantRow {
    user_id: String,
    joined_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct CartLineRow {
    external_product_id: String,
    quantity: i64,
    unit_price: f64,
    product: Json<ProductSnapshot>,
    added_by: String,
    added_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    author_id: String,
    username: String,
    body: String,
    created_at: DateTime<Utc>,
}

const ROOM_COLUMNS: &str = "id, code, name, creator_id, is_active, created_at, updated_at";

async fn room_row(conn: &mut PgConnection, room_id: Uuid, for_update: bool) -> AppResult<Option<RoomRow>> {
    let sql = format!(
        "SELECT {} FROM rooms WHERE id = $1{}",
        ROOM_COLUMNS,
        if for_update { " FOR UPDATE" } else { "" }
    );
    let row = sqlx::query_as::<_, RoomRow>(&sql)
        .bind(room_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row)
}

/// Assemble the full room document from its row and child tables.
async fn hydrate(conn: &mut PgConnection, row: RoomRow) -> AppResult<Room> {
    let participants = sqlx::query_as::<_, ParticipantRow>(
        "SELECT user_id, joined_at FROM room_participants WHERE room_id = $1 ORDER BY joined_at, user_id",
    )
    .bind(row.id)
    .fetch_all(&mut *conn)
    .await?;

    let lines = sqlx::query_as::<_, CartLineRow>(
        r#"
        SELECT external_product_id, quantity, unit_price, product, added_by, added_at
        FROM room_cart_lines WHERE room_id = $1 ORDER BY position
        "#,
    )
    .bind(row.id)
    .fetch_all(&mut *conn)
    .await?;

    let messages = sqlx::query_as::<_, MessageRow>(
        "SELECT author_id, username, body, created_at FROM room_messages WHERE room_id = $1 ORDER BY id",
    )
    .bind(row.id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(Room {
        id: row.id,
        code: row.code,
        name: row.name,
        creator_id: row.creator_id,
        is_active: row.is_active,
        participants: participants
            .into_iter()
            .map(|p| Participant {
                user_id: p.user_id,
                joined_at: p.joined_at,
            })
            .collect(),
        shared_cart: lines
            .into_iter()
            .map(|l| CartLine {
                external_product_id: l.external_product_id,
                quantity: l.quantity,
                unit_price_snapshot: l.unit_price,
                product_snapshot: l.product.0,
                added_by: l.added_by,
                added_at: l.added_at,
            })
            .collect(),
        chat_history: messages
            .into_iter()
            .map(|m| ChatMessage {
                author_id: m.author_id,
                username: m.username,
                body: m.body,
                timestamp: m.created_at,
            })
            .collect(),
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

/// Locked, active room row or `NotFound`.
async fn lock_active(conn: &mut PgConnection, room_id: Uuid) -> AppResult<RoomRow> {
    match room_row(conn, room_id, true).await? {
        Some(row) if row.is_active => Ok(row),
        _ => Err(AppError::NotFound(format!("room {}", room_id))),
    }
}

#[derive(Clone)]
pub struct PgRoomStore {
    pool: DbPool,
}

impl PgRoomStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Lock the room, write the new cart lines and return the open transaction.
    async fn stage_cart(
        &self,
        room_id: Uuid,
        now: DateTime<Utc>,
        mutation: CartMutation<'_>,
    ) -> AppResult<(Transaction<'static, Postgres>, Room)> {
        let mut tx = self.pool.begin().await?;
        let row = lock_active(&mut tx, room_id).await?;
        let mut room = hydrate(&mut tx, row).await?;
        let lines = mutation(&room)?;

        sqlx::query("DELETE FROM room_cart_lines WHERE room_id = $1")
            .bind(room_id)
            .execute(&mut *tx)
            .await?;
        for (position, line) in lines.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO room_cart_lines
                    (room_id, external_product_id, position, quantity, unit_price, product, added_by, added_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(room_id)
            .bind(&line.external_product_id)
            .bind(position as i32)
            .bind(line.quantity)
            .bind(line.unit_price_snapshot)
            .bind(Json(&line.product_snapshot))
            .bind(&line.added_by)
            .bind(line.added_at)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query("UPDATE rooms SET updated_at = $2 WHERE id = $1")
            .bind(room_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        room.shared_cart = lines;
        room.updated_at = now;
        Ok((tx, room))
    }

    async fn load(&self, room_id: Uuid) -> AppResult<Option<Room>> {
        let mut conn = self.pool.acquire().await?;
        match room_row(&mut conn, room_id, false).await? {
            Some(row) => Ok(Some(hydrate(&mut conn, row).await?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl RoomStore for PgRoomStore {
    async fn insert_room(&self, room: &Room) -> AppResult<bool> {
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO rooms (id, code, name, creator_id, is_active, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(room.id)
        .bind(normalize_code(&room.code))
        .bind(&room.name)
        .bind(&room.creator_id)
        .bind(room.is_active)
        .bind(room.created_at)
        .bind(room.updated_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if inserted == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        for p in &room.participants {
            sqlx::query("INSERT INTO room_participants (room_id, user_id, joined_at) VALUES ($1, $2, $3)")
                .bind(room.id)
                .bind(&p.user_id)
                .bind(p.joined_at)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn find_active_by_code(&self, code: &str) -> AppResult<Option<Room>> {
        let id: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM rooms WHERE UPPER(code) = $1 AND is_active")
                .bind(normalize_code(code))
                .fetch_optional(&self.pool)
                .await?;
        match id {
            Some(id) => self.load(id).await,
            None => Ok(None),
        }
    }

    async fn get_room(&self, room_id: Uuid) -> AppResult<Option<Room>> {
        self.load(room_id).await
    }

    async fn add_participant(
        &self,
        room_id: Uuid,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<(Room, bool)> {
        let mut tx = self.pool.begin().await?;
        lock_active(&mut tx, room_id).await?;
        let added = sqlx::query(
            r#"
            INSERT INTO room_participants (room_id, user_id, joined_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (room_id, user_id) DO NOTHING
            "#,
        )
        .bind(room_id)
        .bind(user_id)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;
        if added {
            sqlx::query("UPDATE rooms SET updated_at = $2 WHERE id = $1")
                .bind(room_id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
        }
        let row = lock_active(&mut tx, room_id).await?;
        let room = hydrate(&mut tx, row).await?;
        tx.commit().await?;
        Ok((room, added))
    }

    async fn rooms_for_user(&self, user_id: &str) -> AppResult<Vec<Room>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT r.id FROM rooms r
            JOIN room_participants p ON p.room_id = r.id
            WHERE p.user_id = $1 AND r.is_active
            ORDER BY r.updated_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        let mut rooms = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(room) = self.load(id).await? {
                rooms.push(room);
            }
        }
        Ok(rooms)
    }

    async fn mutate_cart(
        &self,
        room_id: Uuid,
        now: DateTime<Utc>,
        budget: Duration,
        mutation: CartMutation<'_>,
    ) -> AppResult<Room> {
        let (tx, room) = tokio::time::timeout(budget, self.stage_cart(room_id, now, mutation))
            .await
            .map_err(|_| store_timeout(budget))??;
        // not bounded: dropping an issued COMMIT would leave the outcome unknown
        tx.commit().await?;
        Ok(room)
    }

    async fn append_message(&self, room_id: Uuid, message: &ChatMessage) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        let touched = sqlx::query("UPDATE rooms SET updated_at = $2 WHERE id = $1 AND is_active")
            .bind(room_id)
            .bind(message.timestamp)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if touched == 0 {
            return Err(AppError::NotFound(format!("room {}", room_id)));
        }
        sqlx::query(
            "INSERT INTO room_messages (room_id, author_id, username, body, created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(room_id)
        .bind(&message.author_id)
        .bind(&message.username)
        .bind(&message.body)
        .bind(message.timestamp)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn deactivate(&self, room_id: Uuid, now: DateTime<Utc>) -> AppResult<()> {
        let found: Option<Uuid> = sqlx::query_scalar(
            "UPDATE rooms SET is_active = FALSE, updated_at = CASE WHEN is_active THEN $2 ELSE updated_at END WHERE id = $1 RETURNING id",
        )
        .bind(room_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        match found {
            Some(_) => Ok(()),
            None => Err(AppError::NotFound(format!("room {}", room_id))),
        }
    }
}
