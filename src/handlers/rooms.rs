//! Room REST endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use crate::error::AppError;
use crate::handlers::http::AppState;
use crate::middleware::AuthUser;
use crate::models::{CartAction, CartOperation, CartView, ProductSnapshot, RoomView};
use crate::services::checkout::{CheckoutRequest, CheckoutSnapshot};

#[derive(Debug, Deserialize, Validate)]
pub struct CreateRoomRequest {
    #[validate(length(min = 1, max = 100))]
    pub name: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct JoinRoomRequest {
    #[validate(length(min = 1, max = 32))]
    pub code: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartUpdateRequest {
    pub action: CartAction,
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub quantity: Option<i64>,
    #[serde(default)]
    pub product_data: Option<ProductSnapshot>,
}

/// POST /api/rooms
pub async fn create_room(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(body): Json<CreateRoomRequest>,
) -> Result<(StatusCode, Json<RoomView>), AppError> {
    body.validate().map_err(|e| AppError::Validation(e.to_string()))?;
    let room = state
        .room_service()
        .create_room(&body.name, &user.user_id)
        .await?;
    Ok((StatusCode::CREATED, Json(RoomView::from(&room))))
}

/// POST /api/rooms/join
pub async fn join_room(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(body): Json<JoinRoomRequest>,
) -> Result<Json<RoomView>, AppError> {
    body.validate().map_err(|e| AppError::Validation(e.to_string()))?;
    let (room, _) = state
        .room_service()
        .join_room_by_code(&body.code, &user.user_id)
        .await?;
    Ok(Json(RoomView::from(&room)))
}

/// GET /api/rooms/mine
pub async fn my_rooms(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<Vec<RoomView>>, AppError> {
    let rooms = state.room_service().list_rooms_for_user(&user.user_id).await?;
    Ok(Json(rooms.iter().map(RoomView::from).collect()))
}

/// GET /api/rooms/:id
pub async fn get_room(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(room_id): Path<Uuid>,
) -> Result<Json<RoomView>, AppError> {
    let room = state.room_service().get_room(room_id, &user.user_id).await?;
    Ok(Json(RoomView::from(&room)))
}

/// PUT /api/rooms/:id/cart. Same path as the WebSocket `cart-update`, broadcast included.
pub async fn update_cart(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(room_id): Path<Uuid>,
    Json(body): Json<CartUpdateRequest>,
) -> Result<Json<CartView>, AppError> {
    let op = CartOperation::from_request(body.action, body.product_id, body.quantity, body.product_data)?;
    let view = state
        .room_service()
        .apply_cart_operation(room_id, &user, op)
        .await?;
    Ok(Json(view))
}

/// DELETE /api/rooms/:id
pub async fn delete_room(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(room_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.room_service().delete_room(room_id, &user.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/rooms/:id/checkout
pub async fn checkout(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(room_id): Path<Uuid>,
    Json(body): Json<CheckoutRequest>,
) -> Result<Json<CheckoutSnapshot>, AppError> {
    let snapshot = state
        .room_service()
        .checkout(room_id, &user.user_id, body)
        .await?;
    Ok(Json(snapshot))
}
