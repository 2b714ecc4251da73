//! Real-time shared shopping rooms built with Rust.
//!
//! Participants join a room by code, see one synchronized cart, chat, and hand
//! the cart to an order service with a single payer or split payment. Room
//! state lives in PostgreSQL (or process memory); live fan-out runs over
//! WebSocket, optionally relayed through Redis pub/sub.

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod repositories;
pub mod services;

pub use config::Config;
pub use error::AppError;
pub use handlers::http::AppState;
pub use services::channel::ChannelService;
pub use services::presence::PresenceService;

use axum::routing::{get, post, put};
use handlers::{http, rooms};
use tower_http::trace::TraceLayer;

/// Build the API router (ws, rooms, health). Used by main and by integration tests.
pub fn create_app(state: AppState) -> axum::Router {
    let room_routes = axum::Router::new()
        .route("/", post(rooms::create_room))
        .route("/join", post(rooms::join_room))
        .route("/mine", get(rooms::my_rooms))
        .route("/:id", get(rooms::get_room).delete(rooms::delete_room))
        .route("/:id/cart", put(rooms::update_cart))
        .route("/:id/checkout", post(rooms::checkout));

    axum::Router::new()
        .route("/ws", get(handlers::ws_handler))
        .route("/health", get(http::health))
        .nest("/api/rooms", room_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
