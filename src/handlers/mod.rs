//! HTTP and WebSocket request handlers.

pub mod http;
pub mod rooms;
pub mod ws;

pub use http::*;
pub use ws::*;
