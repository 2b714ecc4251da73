//! Data models for rooms, carts, chat, presence and wire events.

pub mod cart;
pub mod chat;
pub mod event;
pub mod presence;
pub mod room;

pub use cart::*;
pub use chat::*;
pub use event::*;
pub use presence::*;
pub use room::*;
