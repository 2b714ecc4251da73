//! Shared HTTP state and health.

use axum::{http::StatusCode, Json};
use serde_json::json;

use crate::auth::JwtSecret;
use crate::services::{PresenceService, RoomService};

/// Shared application state for HTTP and WebSocket handlers.
#[derive(Clone)]
pub struct AppState {
    pub room_service: RoomService,
    pub presence_service: PresenceService,
    pub jwt_secret: JwtSecret,
}

impl AppState {
    pub fn new(room_service: RoomService, jwt_secret: JwtSecret) -> Self {
        Self {
            room_service,
            presence_service: PresenceService::new(),
            jwt_secret,
        }
    }

    pub fn jwt_secret(&self) -> &JwtSecret {
        &self.jwt_secret
    }
    pub fn room_service(&self) -> &RoomService {
        &self.room_service
    }
    pub fn presence_service(&self) -> &PresenceService {
        &self.presence_service
    }
}

/// GET /health: liveness probe.
pub async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({ "status": "ok", "service": "cartroom" })),
    )
}
