//! WebSocket handler: authenticate, upgrade and drive a room session.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header::AUTHORIZATION, HeaderMap},
    response::Response,
};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::auth::Identity;
use crate::error::AppError;
use crate::handlers::http::AppState;
use crate::models::presence::generate_socket_id;
use crate::services::channel::{Outbound, OUTBOUND_CAPACITY};
use crate::services::RoomSession;

/// Bearer token from `?token=` or the `Authorization` header.
pub(crate) fn extract_token(params: &HashMap<String, String>, headers: &HeaderMap) -> Option<String> {
    params
        .get("token")
        .filter(|t| !t.is_empty())
        .cloned()
        .or_else(|| {
            headers
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(|t| t.trim().to_string())
        })
}

/// Upgrade HTTP to WebSocket. The identity is verified before the upgrade.
pub async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let token = extract_token(&params, &headers)
        .ok_or_else(|| AppError::Unauthenticated("token required".to_string()))?;
    let identity = state.jwt_secret().validate(&token)?;
    Ok(ws.on_upgrade(move |socket| handle_socket(state, socket, identity)))
}

async fn handle_socket(state: AppState, socket: WebSocket, identity: Identity) {
    let socket_id = generate_socket_id();
    info!(socket_id = %socket_id, user_id = %identity.user_id, "ws connected");

    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = Outbound::channel(OUTBOUND_CAPACITY);
    let stalled = tx.clone();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    let mut session = RoomSession::new(
        state.room_service().clone(),
        state.presence_service().clone(),
        identity,
        socket_id,
        tx,
    );
    session.greet();

    loop {
        tokio::select! {
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => session.handle_text(&text).await,
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            _ = stalled.overflowed() => {
                warn!(socket_id = %session.socket_id(), "client is not reading, closing");
                break;
            }
        }
    }

    debug!(socket_id = %session.socket_id(), "transport closed");
    session.disconnect().await;
    send_task.abort();
}
