//! Request extractors shared by the HTTP handlers.
//! WebSocket connections authenticate in the upgrade handler instead.

pub mod auth;

pub use auth::AuthUser;
