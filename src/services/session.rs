//! Room session protocol: the state machine of one WebSocket connection.
//!
//! A connection starts with no rooms, joins any number of rooms and leaves them
//! explicitly or all at once on disconnect. Cart, chat and typing actions are
//! only accepted for rooms the connection has joined.

use std::collections::HashSet;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::Identity;
use crate::error::{AppError, AppResult};
use crate::models::{
    CartOperation, CartUpdatePayload, ClientMessage, ConnectionEstablished, ErrorPayload,
    JoinRoomPayload, ServerEvent, UserJoined, UserLeft, UserTyping, WsEvent,
};
use crate::services::channel::Outbound;
use crate::services::presence::PresenceService;
use crate::services::room::RoomService;

pub struct RoomSession {
    rooms: RoomService,
    presence: PresenceService,
    identity: Identity,
    socket_id: String,
    outbound: Outbound,
    joined: HashSet<Uuid>,
}

impl RoomSession {
    pub fn new(
        rooms: RoomService,
        presence: PresenceService,
        identity: Identity,
        socket_id: String,
        outbound: Outbound,
    ) -> Self {
        Self {
            rooms,
            presence,
            identity,
            socket_id,
            outbound,
            joined: HashSet::new(),
        }
    }

    pub fn socket_id(&self) -> &str {
        &self.socket_id
    }

    fn send(&self, frame: WsEvent) {
        match frame.to_json() {
            Ok(text) => {
                // closed or full: the socket is going away and the disconnect path cleans up
                if !self.outbound.push(text) {
                    debug!(socket_id = %self.socket_id, "direct frame not queued");
                }
            }
            Err(e) => warn!(socket_id = %self.socket_id, error = %e, "could not encode frame"),
        }
    }

    fn send_error(&self, room_id: Option<Uuid>, err: &AppError) {
        let event = ServerEvent::Error(ErrorPayload::from(err));
        self.send(WsEvent { room_id, event });
    }

    /// Handshake frame sent once the connection is accepted.
    pub fn greet(&self) {
        let event = ServerEvent::ConnectionEstablished(ConnectionEstablished {
            socket_id: self.socket_id.clone(),
            user_id: self.identity.user_id.clone(),
        });
        self.send(WsEvent::direct(event));
    }

    /// Handle one text frame from the client.
    pub async fn handle_text(&mut self, text: &str) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => self.handle(msg).await,
            Err(e) => {
                debug!(socket_id = %self.socket_id, error = %e, "unparseable client frame");
                self.send_error(None, &AppError::Serialization(e));
            }
        }
    }

    pub async fn handle(&mut self, msg: ClientMessage) {
        let room_id = msg.room_id();
        if let Some(claimed) = msg.claimed_user_id() {
            if claimed != self.identity.user_id {
                warn!(socket_id = %self.socket_id, claimed, "client claimed another identity");
                let err = AppError::Forbidden("userId does not match the authenticated user".to_string());
                self.send_error(room_id, &err);
                return;
            }
        }

        let result = match msg {
            ClientMessage::JoinRoom(p) => self.join(p).await,
            ClientMessage::LeaveRoom(p) => {
                self.leave(p.room_id).await;
                Ok(())
            }
            ClientMessage::CartUpdate(p) => {
                self.cart_update(p).await;
                Ok(())
            }
            ClientMessage::ChatMessage(p) => self.chat(p.room_id, &p.message).await,
            ClientMessage::Typing(p) => self.typing(p.room_id, p.is_typing).await,
            ClientMessage::Ping => {
                self.send(WsEvent::direct(ServerEvent::Pong));
                Ok(())
            }
        };
        if let Err(e) = result {
            debug!(socket_id = %self.socket_id, error = %e, "client action rejected");
            self.send_error(room_id, &e);
        }
    }

    fn ensure_joined(&self, room_id: Uuid) -> AppResult<()> {
        if !self.joined.contains(&room_id) {
            return Err(AppError::Forbidden(format!("join room {} first", room_id)));
        }
        Ok(())
    }

    async fn join(&mut self, p: JoinRoomPayload) -> AppResult<()> {
        let user_id = self.identity.user_id.clone();
        let room = self.rooms.find_active_room(p.room_id).await?;
        if !room.is_participant(&user_id) {
            match p.code.as_deref() {
                Some(code) if room.code_matches(code) => {
                    self.rooms.join_room_by_code(code, &user_id).await?;
                }
                _ => {
                    return Err(AppError::Forbidden(format!(
                        "user '{}' is not a participant of room {}",
                        user_id, room.id
                    )))
                }
            }
        }

        if self.joined.contains(&room.id) {
            let members = self.presence.members(room.id).await;
            self.send(WsEvent::for_room(room.id, ServerEvent::RoomParticipants(members)));
            return Ok(());
        }

        self.rooms
            .channels()
            .subscribe(room.id, &self.socket_id, self.outbound.clone())
            .await?;
        self.joined.insert(room.id);
        let outcome = self
            .presence
            .track_join(room.id, &user_id, &self.identity.username, &self.socket_id)
            .await;
        self.send(WsEvent::for_room(
            room.id,
            ServerEvent::RoomParticipants(outcome.members),
        ));

        if outcome.first_connection {
            let event = ServerEvent::UserJoined(UserJoined {
                user_id: user_id.clone(),
                username: self.identity.username.clone(),
            });
            self.rooms
                .channels()
                .broadcast(room.id, event, Some(&self.socket_id))
                .await?;
        }
        info!(socket_id = %self.socket_id, room_id = %room.id, user_id = %user_id, "joined room");
        Ok(())
    }

    async fn leave(&mut self, room_id: Uuid) {
        if !self.joined.remove(&room_id) {
            return;
        }
        self.rooms.channels().unsubscribe(room_id, &self.socket_id).await;
        let outcome = self
            .presence
            .track_leave(room_id, &self.identity.user_id, &self.socket_id)
            .await;
        if outcome.user_departed {
            self.announce_departure(room_id, &self.identity.user_id, &self.identity.username)
                .await;
        }
        info!(socket_id = %self.socket_id, room_id = %room_id, "left room");
    }

    async fn announce_departure(&self, room_id: Uuid, user_id: &str, username: &str) {
        let event = ServerEvent::UserLeft(UserLeft {
            user_id: user_id.to_string(),
            username: Some(username.to_string()),
        });
        if let Err(e) = self
            .rooms
            .channels()
            .broadcast(room_id, event, Some(&self.socket_id))
            .await
        {
            warn!(room_id = %room_id, error = %e, "user-left broadcast failed");
        }
    }

    /// Cart failures are reported to the actor only.
    async fn cart_update(&mut self, p: CartUpdatePayload) {
        let room_id = p.room_id;
        let result = async {
            self.ensure_joined(room_id)?;
            let op = CartOperation::from_request(p.action, p.product_id, p.quantity, p.product_data)?;
            self.rooms
                .apply_cart_operation(room_id, &self.identity, op)
                .await
        }
        .await;
        if let Err(e) = result {
            debug!(socket_id = %self.socket_id, room_id = %room_id, error = %e, "cart update rejected");
            self.send(WsEvent::for_room(
                room_id,
                ServerEvent::CartUpdateError(ErrorPayload::from(&e)),
            ));
        }
    }

    async fn chat(&mut self, room_id: Uuid, body: &str) -> AppResult<()> {
        self.ensure_joined(room_id)?;
        self.rooms
            .post_chat_message(room_id, &self.identity, body)
            .await?;
        Ok(())
    }

    async fn typing(&mut self, room_id: Uuid, is_typing: bool) -> AppResult<()> {
        self.ensure_joined(room_id)?;
        let event = ServerEvent::UserTyping(UserTyping {
            user_id: self.identity.user_id.clone(),
            username: self.identity.username.clone(),
            is_typing,
        });
        self.rooms
            .channels()
            .broadcast(room_id, event, Some(&self.socket_id))
            .await
    }

    /// Transport lost: leave every room this connection held.
    pub async fn disconnect(mut self) {
        let rooms: Vec<Uuid> = self.joined.drain().collect();
        for room_id in &rooms {
            self.rooms.channels().unsubscribe(*room_id, &self.socket_id).await;
        }
        for departure in self.presence.track_disconnect(&self.socket_id).await {
            if departure.user_departed {
                self.announce_departure(
                    departure.room_id,
                    &departure.member.user_id,
                    &departure.member.username,
                )
                .await;
            }
            if departure.room_empty {
                debug!(room_id = %departure.room_id, "room has no live connections");
            }
        }
        info!(socket_id = %self.socket_id, rooms = rooms.len(), "session closed");
    }
}
